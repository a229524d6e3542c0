use std::path::PathBuf;
use std::process::Command;

use anyhow::Context as _;
use clap::Parser;

const EBPF_CRATE: &str = "netinsight-ebpf";
const EBPF_TARGET: &str = "bpfel-unknown-none";
const AGENT: &str = "netinsight";

#[derive(Parser)]
enum Cli {
    /// Compile the XDP probe for bpfel-unknown-none.
    BuildEbpf {
        #[arg(long)]
        release: bool,
    },
    /// Compile the XDP probe, then the agent.
    Build {
        #[arg(long)]
        release: bool,
    },
    /// Compile everything and run the agent with sudo against the fresh probe.
    Run {
        #[arg(long)]
        release: bool,
        /// Extra arguments passed to the agent, e.g. `-- --interface eth1`.
        #[arg(trailing_var_arg = true, allow_hyphen_values = true)]
        args: Vec<String>,
    },
}

fn main() -> anyhow::Result<()> {
    match Cli::parse() {
        Cli::BuildEbpf { release } => build_ebpf(release),
        Cli::Build { release } => {
            build_ebpf(release)?;
            build_agent(release)
        }
        Cli::Run { release, args } => {
            build_ebpf(release)?;
            build_agent(release)?;
            run(release, &args)
        }
    }
}

fn workspace_root() -> PathBuf {
    PathBuf::from(concat!(env!("CARGO_MANIFEST_DIR"), "/.."))
}

fn profile(release: bool) -> &'static str {
    if release {
        "release"
    } else {
        "debug"
    }
}

/// Path of the compiled probe object, as the agent expects it.
fn ebpf_object(release: bool) -> PathBuf {
    workspace_root()
        .join(EBPF_CRATE)
        .join("target")
        .join(EBPF_TARGET)
        .join(profile(release))
        .join(AGENT)
}

fn build_ebpf(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(workspace_root().join(EBPF_CRATE));
    cmd.args([
        "+nightly",
        "build",
        "--target",
        EBPF_TARGET,
        "-Z",
        "build-std=core",
    ]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for the XDP probe")?;
    anyhow::ensure!(status.success(), "XDP probe build failed");
    Ok(())
}

fn build_agent(release: bool) -> anyhow::Result<()> {
    let mut cmd = Command::new("cargo");
    cmd.current_dir(workspace_root());
    cmd.args(["build", "--package", AGENT]);
    if release {
        cmd.arg("--release");
    }
    let status = cmd
        .status()
        .context("failed to run cargo build for the agent")?;
    anyhow::ensure!(status.success(), "agent build failed");
    Ok(())
}

fn run(release: bool, extra_args: &[String]) -> anyhow::Result<()> {
    let bin = workspace_root()
        .join("target")
        .join(profile(release))
        .join(AGENT);
    let object = ebpf_object(release);

    let mut cmd = Command::new("sudo");
    cmd.arg(&bin);
    cmd.arg("--ebpf-object").arg(&object);
    cmd.args(extra_args);
    let status = cmd
        .status()
        .with_context(|| format!("failed to run {}", bin.display()))?;
    anyhow::ensure!(status.success(), "{AGENT} exited with error");
    Ok(())
}
