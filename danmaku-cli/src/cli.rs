use std::path::PathBuf;

use clap::Parser;

#[derive(Parser, Debug)]
#[command(
    name = "danmaku",
    version,
    about = "Watch a Bilibili live room's chat and send messages from the terminal"
)]
pub struct Args {
    /// Room id (short or long form)
    pub room_id: u64,

    /// Credential file (JSON). Created with empty values if missing.
    #[arg(long, env = "DANMAKU_CREDENTIALS")]
    pub credentials: Option<PathBuf>,

    /// Cookie string to use instead of the credential file
    /// (e.g. "SESSDATA=...; bili_jct=...; DedeUserID=...")
    #[arg(long, env = "DANMAKU_COOKIES")]
    pub cookies: Option<String>,

    /// Save credentials parsed from --cookies into the credential file
    #[arg(long, requires = "cookies")]
    pub save_cookies: bool,

    /// Configuration file (TOML)
    #[arg(short, long)]
    pub config: Option<PathBuf>,

    /// Only print chat, do not read messages from stdin
    #[arg(long)]
    pub read_only: bool,

    /// Skip the stream URL lookup
    #[arg(long)]
    pub no_stream_url: bool,

    /// Print chat events as JSON lines
    #[arg(long)]
    pub json: bool,

    /// Disable colored output
    #[arg(long)]
    pub no_color: bool,

    /// Enable verbose logging
    #[arg(short, long, conflicts_with = "quiet")]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long)]
    pub quiet: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_minimal_args() {
        let args = Args::try_parse_from(["danmaku", "21452505"]).unwrap();
        assert_eq!(args.room_id, 21452505);
        assert!(!args.read_only);
        assert!(args.cookies.is_none());
    }

    #[test]
    fn test_save_cookies_requires_cookies() {
        assert!(Args::try_parse_from(["danmaku", "1", "--save-cookies"]).is_err());
        assert!(
            Args::try_parse_from(["danmaku", "1", "--cookies", "SESSDATA=a", "--save-cookies"])
                .is_ok()
        );
    }

    #[test]
    fn test_verbose_conflicts_with_quiet() {
        assert!(Args::try_parse_from(["danmaku", "1", "-v", "-q"]).is_err());
    }
}
