use std::path::PathBuf;

use clap::{Parser, Subcommand};
use mediagrab_engine::ProxyType;

#[derive(Parser, Debug)]
#[command(name = "mediagrab")]
#[command(about = "Probe and download progressive, HLS and DASH media")]
#[command(version)]
pub struct Args {
    #[command(subcommand)]
    pub command: Commands,

    /// Configuration file (defaults to <config_dir>/mediagrab/config.toml)
    #[arg(short, long, global = true)]
    pub config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Only log errors and hide the progress bar
    #[arg(short, long, global = true, conflicts_with = "verbose")]
    pub quiet: bool,

    #[command(flatten)]
    pub download: DownloadArgs,
}

/// Overrides for the configuration file.
#[derive(clap::Args, Debug, Default, Clone)]
pub struct DownloadArgs {
    /// Parallel chunk/segment requests
    #[arg(long, global = true)]
    pub concurrency: Option<usize>,

    /// Chunk size in bytes for ranged downloads
    #[arg(long, global = true)]
    pub chunk_size: Option<u64>,

    /// Retry attempts for transient network errors
    #[arg(long, global = true)]
    pub retries: Option<u32>,

    /// Per-request timeout in seconds
    #[arg(long, global = true)]
    pub timeout: Option<u64>,

    /// Rewrite direct downloads through the media toolkit
    #[arg(long, global = true)]
    pub remux: bool,

    /// Directory finished files are written to
    #[arg(short, long, global = true)]
    pub output_dir: Option<PathBuf>,

    /// Extra request header, `Name: Value` (repeatable)
    #[arg(short = 'H', long = "header", global = true)]
    pub headers: Vec<String>,

    /// Cookie, `name=value` (repeatable)
    #[arg(long = "cookie", global = true)]
    pub cookies: Vec<String>,

    /// Proxy server URL
    #[arg(long, global = true)]
    pub proxy: Option<String>,

    #[arg(long, global = true, value_enum, default_value = "http")]
    pub proxy_type: ProxyType,

    #[arg(long, global = true, requires = "proxy")]
    pub proxy_username: Option<String>,

    #[arg(long, global = true, requires = "proxy")]
    pub proxy_password: Option<String>,
}

#[derive(Subcommand, Debug)]
pub enum Commands {
    /// List the formats of a manifest, best default marked
    Probe {
        /// Manifest or media URL
        url: String,

        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },

    /// Download the default (or a chosen) format
    Fetch {
        /// Manifest or media URL
        url: String,

        /// Format id as listed by `probe`
        #[arg(short, long)]
        format: Option<String>,

        /// Overall time limit in seconds
        #[arg(long)]
        deadline: Option<u64>,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn global_flags_after_subcommand() {
        let args = Args::try_parse_from([
            "mediagrab",
            "fetch",
            "https://example.com/a.m3u8",
            "--format",
            "hls-1200",
            "--concurrency",
            "8",
            "-H",
            "Referer: https://example.com",
            "--deadline",
            "60",
        ])
        .unwrap();
        assert_eq!(args.download.concurrency, Some(8));
        assert_eq!(args.download.headers, vec!["Referer: https://example.com"]);
        match args.command {
            Commands::Fetch {
                format, deadline, ..
            } => {
                assert_eq!(format.as_deref(), Some("hls-1200"));
                assert_eq!(deadline, Some(60));
            }
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["mediagrab", "-v", "-q", "probe", "x"]).is_err());
    }
}
