//
// main.rs
//
// Copyright (C) 2024-2025 Posit Software, PBC. All rights reserved.
//
//

//! Starts a Jupyter kernel, runs code in it, and shuts it down again.

use std::fs::File;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::{bail, Context};
use clap::{command, Parser};
use jkmanager::execution_log::ExecutionEntry;
use jkmanager::kernel_client::KernelClient;
use jkmanager::kernel_manager::{KernelManager, KernelManagerOptions};
use jkmanager::kernel_spec_manager::KernelSpecManager;
use jkshared::jupyter_message::msg_type;
use log::LevelFilter;
use simplelog::{ColorChoice, CombinedLogger, Config, TermLogger, TerminalMode, WriteLogger};

#[derive(Parser, Debug)]
#[command(version, about, long_about = None)]
struct Args {
    /// The name of the installed kernel to start
    #[arg(default_value = "python3")]
    kernel: String,

    /// Code to run in the kernel. May be given more than once; blocks run in
    /// order.
    #[arg(short, long)]
    code: Vec<String>,

    /// A file whose contents are run as one more code block, after any
    /// `--code` blocks
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// List the installed kernels and exit
    #[arg(long)]
    list: bool,

    /// Where to write the kernel's connection file. A temporary file is used
    /// if not specified.
    #[arg(long)]
    connection_file: Option<PathBuf>,

    /// How many times to try connecting to the kernel
    #[arg(long, default_value_t = 3)]
    attempts: u32,

    /// Seconds to wait for the kernel to connect on each attempt
    #[arg(long, default_value_t = 10)]
    connect_timeout: u64,

    /// Seconds to wait for all code blocks to finish
    #[arg(long, default_value_t = 60)]
    wait_timeout: u64,

    /// The log level to use. Valid values are "trace", "debug", "info", "warn",
    /// and "error". If not specified, the default log level is "info", or the
    /// value of `RUST_LOG` if set.
    #[arg(short, long)]
    log_level: Option<String>,

    /// The path to a log file. If specified, log output will be written to this
    /// file in addition to standard streams.
    #[arg(long)]
    log_file: Option<String>,

    /// Extra arguments passed to the kernel after its own command line
    #[arg(last = true)]
    kernel_args: Vec<String>,
}

fn init_logging(args: &Args) -> anyhow::Result<()> {
    let log_level = match args.log_level {
        Some(ref level) => level.to_string(),
        None => std::env::var("RUST_LOG").unwrap_or_else(|_| String::from("info")),
    };

    let log_level = match log_level.as_str() {
        "trace" => LevelFilter::Trace,
        "debug" => LevelFilter::Debug,
        "info" => LevelFilter::Info,
        "warn" => LevelFilter::Warn,
        "error" => LevelFilter::Error,
        _ => {
            eprintln!("Invalid log level '{}'; using 'info'", log_level);
            LevelFilter::Info
        }
    };

    match args.log_file {
        Some(ref log_file) => {
            let file = File::create(log_file)
                .with_context(|| format!("Failed to create log file {}", log_file))?;
            CombinedLogger::init(vec![
                TermLogger::new(
                    log_level,
                    Config::default(),
                    TerminalMode::Stderr,
                    ColorChoice::Auto,
                ),
                WriteLogger::new(log_level, Config::default(), file),
            ])
            .context("Failed to initialize combined file/terminal logging")?;
        }
        None => {
            TermLogger::init(
                log_level,
                Config::default(),
                TerminalMode::Stderr,
                ColorChoice::Auto,
            )
            .context("Failed to initialize terminal logging")?;
        }
    }
    Ok(())
}

fn list_kernels(specs: &KernelSpecManager) {
    let mut found: Vec<(String, PathBuf)> = specs.find_kernel_specs().into_iter().collect();
    found.sort();
    if found.is_empty() {
        println!("No kernels found");
        return;
    }
    for (name, dir) in found {
        println!("{:<20} {}", name, dir.display());
    }
}

/// Print what an execution wrote: streams as-is, results and displays as
/// their plain text form.
fn print_output(entry: &ExecutionEntry) {
    for response in &entry.responses {
        match response.msg_type() {
            msg_type::STREAM => {
                if let Some(text) = response.content_field("text").and_then(|t| t.as_str()) {
                    print!("{}", text);
                }
            }
            msg_type::EXECUTE_RESULT | msg_type::DISPLAY_DATA => {
                if let Some(text) = response.data("text/plain").and_then(|t| t.as_str()) {
                    println!("{}", text);
                }
            }
            _ => {}
        }
    }
}

async fn run_code(client: &KernelClient, blocks: &[String], wait: Duration) -> anyhow::Result<()> {
    for block in blocks {
        client
            .execute(block)
            .await
            .context("Failed to send code to the kernel")?;
    }
    if !client.wait_for_pending(wait).await {
        log::warn!(
            "{} code block(s) still running after {:?}",
            client.pending_execute_count(),
            wait
        );
    }
    for entry in client.execute_log() {
        print_output(&entry);
    }
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_logging(&args)?;

    let specs = KernelSpecManager::new();
    if args.list {
        list_kernels(&specs);
        return Ok(());
    }

    let mut blocks = args.code.clone();
    if let Some(ref path) = args.file {
        let code = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read {}", path.display()))?;
        blocks.push(code);
    }

    let options = KernelManagerOptions {
        connection_file: args.connection_file.clone(),
        ..KernelManagerOptions::default()
    };
    let mut manager = KernelManager::new(&args.kernel, &specs, options)?;
    manager.start_kernel(&args.kernel_args).await?;
    log::info!(
        "Started kernel '{}' ({})",
        manager.kernel_name(),
        manager.kernel_spec().display_name
    );

    let client = match manager
        .create_client_and_wait_for_connection(
            args.attempts,
            Duration::from_secs(args.connect_timeout),
        )
        .await
    {
        Ok(client) => client,
        Err(err) => {
            err.log();
            manager.shutdown().await;
            return Err(err.into());
        }
    };

    let result = run_code(&client, &blocks, Duration::from_secs(args.wait_timeout)).await;
    // A failed block reports its error on iopub and again in the execute reply
    let mut errors = client.execute_errors();
    errors.dedup();

    client.stop_channels().await;
    let outcome = manager.shutdown().await;
    log::info!("Kernel shutdown: {:?}", outcome);

    result?;
    if !errors.is_empty() {
        for error in &errors {
            eprintln!("{}", error);
        }
        bail!(
            "{} error{} while running code",
            errors.len(),
            if errors.len() == 1 { "" } else { "s" }
        );
    }
    Ok(())
}
