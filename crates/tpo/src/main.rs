//! Tensor Program Optimizer - Main Entry Point
//!
//! Reads a fused-kernel description, runs the pipeline its `process` asks
//! for and prints the chosen tiles, launch configuration and pass timings.

use anyhow::{anyhow, Context, Result};
use camino::Utf8PathBuf;
use clap::Parser;
use tpo_driver::{Optimized, Optimizer};
use tpo_session::{create_session, UserConfig};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// Tiles and maps a fused tensor kernel
#[derive(Parser, Debug)]
#[command(name = "tpo")]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Kernel description (JSON)
    #[arg(value_name = "FILE")]
    kernel: Utf8PathBuf,

    /// Enable verbose output
    #[arg(short, long)]
    verbose: bool,

    /// Set a configuration attribute, e.g. `--set bind_thread="32 8"`
    #[arg(long = "set", value_name = "KEY=VALUE")]
    attrs: Vec<String>,

    /// Directory receiving `tiling.log`
    #[arg(long, value_name = "DIR")]
    dump_dir: Option<Utf8PathBuf>,

    /// Print the final schedule tree
    #[arg(long)]
    print_tree: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    let log_level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    let mut config = UserConfig::from_attrs(parse_attrs(&cli.attrs)?)?;
    if let Some(dir) = &cli.dump_dir {
        config.dump_dir = Some(dir.clone());
    }
    let target = tpo_target::global()?.clone();
    let session = create_session(config, target);

    let json = std::fs::read_to_string(&cli.kernel).with_context(|| format!("failed to read {}", cli.kernel))?;
    let optimizer = Optimizer::new(session.clone());
    let out = optimizer.optimize_json(&json)?;

    print_result(&out, cli.print_tree);
    if let Some(path) = session.flush_log()? {
        println!("Log written to {path}");
    }
    Ok(())
}

fn parse_attrs(attrs: &[String]) -> Result<Vec<(String, String)>> {
    attrs
        .iter()
        .map(|a| {
            let (key, value) = a
                .split_once('=')
                .ok_or_else(|| anyhow!("expected KEY=VALUE, got `{a}`"))?;
            Ok((key.trim().to_string(), value.trim().trim_matches('"').to_string()))
        })
        .collect()
}

fn print_result(out: &Optimized, print_tree: bool) {
    println!("Process: {}", out.process.name());
    if let Some(plan) = &out.context.plan {
        for (b, band) in plan.bands.iter().enumerate() {
            println!("Band {b}: L1 {:?} L0 {:?}", band.l1, band.l0);
        }
    }
    if let Some(gpu) = &out.context.gpu {
        println!("Template: {}", gpu.template);
        println!("Block config: {}", gpu.block_cfg);
        println!("Thread config: {}", gpu.thread_cfg);
    }
    for buffer in out.context.buffers.iter() {
        println!("Buffer {} [{}] {:?} ({} bytes)", buffer.buffer, buffer.scope, buffer.sizes, buffer.bytes());
    }
    if out.report.retries > 0 {
        println!("Retries: {}", out.report.retries);
    }
    for timing in &out.report.timings {
        println!("{timing}");
    }
    if print_tree {
        if let Some(tree) = out.tree_dump() {
            println!("{tree}");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_attrs() {
        let attrs = parse_attrs(&["bind_thread=\"32 8\"".to_string(), "core_num = 2".to_string()]).unwrap();
        assert_eq!(
            attrs,
            vec![
                ("bind_thread".to_string(), "32 8".to_string()),
                ("core_num".to_string(), "2".to_string())
            ]
        );
        assert!(parse_attrs(&["oops".to_string()]).is_err());
    }

    #[test]
    fn test_cli_parses() {
        let cli = Cli::parse_from(["tpo", "k.json", "--set", "core_num=2", "--print-tree", "-v"]);
        assert_eq!(cli.kernel, "k.json");
        assert_eq!(cli.attrs, ["core_num=2"]);
        assert!(cli.print_tree && cli.verbose);
    }
}
