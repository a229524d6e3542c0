use serde::Deserialize;
use std::fs;
use std::path::Path;

use netinsight::loader::XdpMode;

/// Application configuration, loadable from CLI or YAML file.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    /// Network interface to attach the XDP probe on.
    #[serde(default)]
    pub interface: Option<String>,

    /// XDP attach mode.
    #[serde(default)]
    pub xdp_mode: XdpMode,

    /// Compiled eBPF object to load.
    #[serde(default = "default_ebpf_object")]
    pub ebpf_object: String,

    /// API server port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// How often the kernel tables are read, in seconds.
    #[serde(default = "default_poll_interval")]
    pub poll_interval_seconds: u64,

    /// Delete table rows after reading them, so every snapshot covers one
    /// poll interval instead of the probe's whole lifetime.
    #[serde(default)]
    pub drain_on_read: bool,

    /// Quiet mode (suppress non-error logs).
    #[serde(default)]
    pub quiet: bool,

    /// List of CIDRs allowed to access the API (empty = allow all).
    #[serde(default)]
    pub allowed_ips: Vec<String>,
}

fn default_ebpf_object() -> String {
    "netinsight-ebpf/target/bpfel-unknown-none/release/netinsight".to_string()
}

fn default_port() -> u16 {
    3000
}

fn default_poll_interval() -> u64 {
    10
}

impl Default for Config {
    fn default() -> Self {
        Self {
            interface: None,
            xdp_mode: XdpMode::default(),
            ebpf_object: default_ebpf_object(),
            port: default_port(),
            poll_interval_seconds: default_poll_interval(),
            drain_on_read: false,
            quiet: false,
            allowed_ips: Vec::new(),
        }
    }
}

impl Config {
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let content = fs::read_to_string(path)?;
        let config: Config = serde_yaml::from_str(&content)?;
        Ok(config)
    }

    /// Merge CLI args into config (CLI takes precedence).
    pub fn merge_cli(&mut self, cli: &CliArgs) {
        if cli.interface.is_some() {
            self.interface = cli.interface.clone();
        }
        if let Some(mode) = cli.xdp_mode {
            self.xdp_mode = mode;
        }
        if let Some(ref object) = cli.ebpf_object {
            self.ebpf_object = object.clone();
        }
        if cli.port != 3000 {
            self.port = cli.port;
        }
        if cli.poll_interval != 10 {
            self.poll_interval_seconds = cli.poll_interval;
        }
        if cli.drain {
            self.drain_on_read = true;
        }
        if cli.quiet {
            self.quiet = true;
        }
        if !cli.allowed_ips.is_empty() {
            self.allowed_ips = cli.allowed_ips.clone();
        }
    }

    pub fn interface(&self) -> &str {
        self.interface.as_deref().unwrap_or("eth0")
    }
}

use clap::Parser;

/// netinsight: XDP network telemetry probe
#[derive(Parser, Debug, Clone)]
#[command(version, about, long_about = None)]
pub struct CliArgs {
    /// Network interface to attach the XDP probe to (e.g., eth0).
    #[arg(short, long)]
    pub interface: Option<String>,

    /// XDP attach mode.
    #[arg(long, value_enum)]
    pub xdp_mode: Option<XdpMode>,

    /// Path to the compiled eBPF object.
    #[arg(long)]
    pub ebpf_object: Option<String>,

    /// Port to serve the API on.
    #[arg(short, long, default_value_t = 3000)]
    pub port: u16,

    /// Path to YAML config file.
    #[arg(short, long)]
    pub config: Option<String>,

    /// Seconds between two reads of the kernel tables.
    #[arg(long, default_value_t = 10)]
    pub poll_interval: u64,

    /// Delete table rows after each read.
    #[arg(long)]
    pub drain: bool,

    /// Quiet mode (suppress non-error logs).
    #[arg(short = 'q', long)]
    pub quiet: bool,

    /// IP CIDRs allowed to access the API (e.g., 10.0.0.0/8). Repeat for multiple.
    #[arg(long)]
    pub allowed_ips: Vec<String>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_from_file_fills_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "interface: enp3s0\nxdp_mode: driver\ndrain_on_read: true").unwrap();

        let config = Config::from_file(file.path()).unwrap();
        assert_eq!(config.interface(), "enp3s0");
        assert_eq!(config.xdp_mode, XdpMode::Driver);
        assert!(config.drain_on_read);
        assert_eq!(config.port, 3000);
        assert_eq!(config.poll_interval_seconds, 10);
        assert!(config.allowed_ips.is_empty());
    }

    #[test]
    fn test_from_file_rejects_bad_mode() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        writeln!(file, "xdp_mode: turbo").unwrap();
        assert!(Config::from_file(file.path()).is_err());
    }

    #[test]
    fn test_cli_overrides_file() {
        let mut config = Config {
            interface: Some("eth1".into()),
            port: 8080,
            ..Default::default()
        };
        let cli = CliArgs::parse_from([
            "netinsight",
            "--interface",
            "wlan0",
            "--xdp-mode",
            "hw",
            "--poll-interval",
            "2",
            "--allowed-ips",
            "10.0.0.0/8",
        ]);
        config.merge_cli(&cli);

        assert_eq!(config.interface(), "wlan0");
        assert_eq!(config.xdp_mode, XdpMode::Hw);
        assert_eq!(config.poll_interval_seconds, 2);
        assert_eq!(config.allowed_ips, vec!["10.0.0.0/8".to_string()]);
        // Left at its CLI default, so the file value stays.
        assert_eq!(config.port, 8080);
        assert!(!config.drain_on_read);
    }

    #[test]
    fn test_default_interface() {
        assert_eq!(Config::default().interface(), "eth0");
    }
}
