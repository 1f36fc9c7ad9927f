use clap::{Parser, Subcommand};

#[derive(Parser)]
#[command(
    name = "ytclip",
    about = "Cut audio clips out of YouTube videos and publish them to object storage",
    version,
    long_about = "An HTTP service and CLI that downloads the audio of a YouTube video, trims the requested time range to MP3 with ffmpeg and uploads the clip to S3-compatible storage. Runs the HTTP service when no command is given."
)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Option<Commands>,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Disable progress indicators
    #[arg(short, long, global = true)]
    pub quiet: bool,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP service
    Serve {
        /// Bind address (overrides HOST)
        #[arg(long, value_name = "ADDR")]
        host: Option<String>,

        /// Listen port (overrides PORT)
        #[arg(short, long)]
        port: Option<u16>,
    },

    /// Cut and publish one clip, then print the result as JSON
    Extract {
        /// YouTube watch or short link
        #[arg(value_name = "URL")]
        url: String,

        /// Clip start (SS, MM:SS or HH:MM:SS)
        #[arg(short, long)]
        start: String,

        /// Clip end (SS, MM:SS or HH:MM:SS)
        #[arg(short, long)]
        end: String,
    },

    /// Check that the external tools are installed
    Doctor,

    /// Inspect configuration
    Config {
        /// Show current configuration
        #[arg(short, long)]
        show: bool,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_definition() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_no_command_means_serve() {
        let cli = Cli::parse_from(["ytclip"]);
        assert!(cli.command.is_none());

        let cli = Cli::parse_from(["ytclip", "extract", "https://youtu.be/abc", "-s", "0:10", "-e", "0:40"]);
        match cli.command {
            Some(Commands::Extract { url, start, end }) => {
                assert_eq!(url, "https://youtu.be/abc");
                assert_eq!(start, "0:10");
                assert_eq!(end, "0:40");
            }
            _ => panic!("expected extract"),
        }
    }
}
