use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use hlsdl_engine::hls::retry::RetryPolicy;
use hlsdl_engine::{ProxyType, SessionConfig};

use crate::error::{AppError, Result};

#[derive(Parser, Debug)]
#[command(name = "hlsdl", author, version, about = "Download HLS video-on-demand streams", long_about = None)]
pub struct Args {
    /// Playlist URL, or a page that links to one
    pub url: String,

    /// Directory the output file is written to
    #[arg(short = 'o', long, value_name = "DIR")]
    pub output_dir: Option<PathBuf>,

    /// Directory segments are staged in (defaults to the output directory)
    #[arg(long, value_name = "DIR")]
    pub temp_dir: Option<PathBuf>,

    /// Output file name without extension
    #[arg(short = 'n', long)]
    pub name: Option<String>,

    /// Number of segments downloaded at the same time (1-1000)
    #[arg(short = 'c', long, default_value_t = 8)]
    pub concurrency: usize,

    /// Extra request header, may be repeated
    #[arg(short = 'H', long = "header", value_name = "NAME: VALUE")]
    pub headers: Vec<String>,

    /// Proxy URL, e.g. socks5://127.0.0.1:1080
    #[arg(long)]
    pub proxy: Option<String>,

    /// Proxy scheme used when --proxy has none
    #[arg(long, value_enum, requires = "proxy")]
    pub proxy_type: Option<ProxyType>,

    /// Accept invalid TLS certificates
    #[arg(short = 'k', long)]
    pub insecure: bool,

    /// Skip expression, e.g. "1-10, http.code=404, time:00:00:00-00:01:30"
    #[arg(short = 's', long, default_value = "")]
    pub skip: String,

    /// Drop segments that sit between two discontinuity markers
    #[arg(long)]
    pub skip_discontinuity_wrapped: bool,

    /// Keep the segment directory after assembly
    #[arg(long)]
    pub keep_segments: bool,

    /// Download segments only, do not assemble an output file
    #[arg(long)]
    pub skip_assembly: bool,

    /// Do not consult or update the result cache
    #[arg(long)]
    pub no_cache: bool,

    /// Attempts per segment, including the first
    #[arg(long, default_value_t = 5)]
    pub attempts: u32,

    /// Per-segment request timeout in seconds
    #[arg(long, default_value_t = 120)]
    pub segment_timeout: u64,

    /// Enable debug logging
    #[arg(short, long)]
    pub verbose: bool,

    /// Only log errors
    #[arg(short, long, conflicts_with = "verbose")]
    pub quiet: bool,
}

impl Args {
    pub fn session_config(&self) -> Result<SessionConfig> {
        let headers = self
            .headers
            .iter()
            .map(|raw| parse_header(raw))
            .collect::<Result<Vec<_>>>()?;

        Ok(SessionConfig {
            save_dir: self.output_dir.clone(),
            temp_dir: self.temp_dir.clone(),
            file_name: self.name.clone(),
            concurrency: self.concurrency,
            headers,
            proxy: self.proxy_url(),
            insecure: self.insecure,
            skip_expression: self.skip.clone(),
            skip_discontinuity_wrapped: self.skip_discontinuity_wrapped,
            keep_segments: self.keep_segments,
            skip_assembly: self.skip_assembly,
            use_cache: !self.no_cache,
            retry: RetryPolicy {
                max_attempts: self.attempts.max(1),
                ..RetryPolicy::default()
            },
            segment_timeout: Duration::from_secs(self.segment_timeout),
            ..SessionConfig::new(self.url.clone())
        })
    }

    fn proxy_url(&self) -> Option<String> {
        let proxy = self.proxy.as_deref()?.trim();
        match self.proxy_type {
            Some(proxy_type) if !proxy.contains("://") => {
                let scheme = match proxy_type {
                    ProxyType::Http => "http",
                    ProxyType::Https => "https",
                    ProxyType::Socks5 => "socks5",
                };
                Some(format!("{scheme}://{proxy}"))
            }
            _ => Some(proxy.to_string()),
        }
    }
}

/// Split `Name: value` into its parts.
fn parse_header(raw: &str) -> Result<(String, String)> {
    let (name, value) = raw
        .split_once(':')
        .ok_or_else(|| AppError::InvalidInput(format!("header `{raw}` is not `Name: value`")))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(AppError::InvalidInput(format!("header `{raw}` has no name")));
    }
    Ok((name.to_string(), value.trim().to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_flags_onto_session_config() {
        let args = Args::try_parse_from([
            "hlsdl",
            "https://cdn.example/v/index.m3u8",
            "-c",
            "16",
            "-H",
            "Cookie: a=b; c=d",
            "-H",
            "Referer:https://example.com/",
            "--skip",
            "1-3, http.code=404",
            "--no-cache",
            "--attempts",
            "3",
        ])
        .unwrap();
        let config = args.session_config().unwrap();

        assert_eq!(config.url, "https://cdn.example/v/index.m3u8");
        assert_eq!(config.concurrency, 16);
        assert_eq!(
            config.headers,
            vec![
                ("Cookie".to_string(), "a=b; c=d".to_string()),
                ("Referer".to_string(), "https://example.com/".to_string()),
            ]
        );
        assert_eq!(config.skip_expression, "1-3, http.code=404");
        assert!(!config.use_cache);
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn rejects_malformed_header() {
        let args = Args::try_parse_from(["hlsdl", "http://h/i.m3u8", "-H", "no-colon"]).unwrap();
        assert!(matches!(
            args.session_config(),
            Err(AppError::InvalidInput(_))
        ));
    }

    #[test]
    fn proxy_type_supplies_missing_scheme() {
        let args = Args::try_parse_from([
            "hlsdl",
            "http://h/i.m3u8",
            "--proxy",
            "127.0.0.1:1080",
            "--proxy-type",
            "socks5",
        ])
        .unwrap();
        assert_eq!(args.proxy_url().as_deref(), Some("socks5://127.0.0.1:1080"));

        let args = Args::try_parse_from([
            "hlsdl",
            "http://h/i.m3u8",
            "--proxy",
            "http://10.0.0.1:8080",
            "--proxy-type",
            "socks5",
        ])
        .unwrap();
        assert_eq!(args.proxy_url().as_deref(), Some("http://10.0.0.1:8080"));
    }

    #[test]
    fn verbose_and_quiet_conflict() {
        assert!(Args::try_parse_from(["hlsdl", "http://h/i.m3u8", "-v", "-q"]).is_err());
    }
}
