// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at https://mozilla.org/MPL/2.0/.
//
// Copyright (c) 2025 Pegasus Heavy Industries, LLC

//! spacey-import CLI - run one typed import and print the module namespace

use clap::Parser;
use owo_colors::OwoColorize;
use spacey_loader::{
    builtin, Handler, HandlerRegistry, ImportAssertion, ImportBindings, LoaderConfig, ModuleLoader,
    VERSION,
};
use std::path::PathBuf;
use std::process::ExitCode;

#[derive(Parser)]
#[command(
    name = "spacey-import",
    about = "Import an asset through the Spacey typed-import pipeline",
    version = VERSION,
    author = "Pegasus Heavy Industries"
)]
struct Cli {
    /// Asset to import, relative to the current directory
    path: String,

    /// Asserted import type
    #[arg(short = 't', long = "type")]
    asserted_type: String,

    /// Built-in handler to pass inline (csv, json, text, lines)
    #[arg(long)]
    handler: Option<String>,

    /// Text encoding, or `blob`
    #[arg(long)]
    encoding: Option<String>,

    /// Fallback policy (registry-only, native-on-registry-miss, prefer-native)
    #[arg(short = 'p', long)]
    policy: Option<String>,

    /// Config file (default: <config dir>/spacey/loader.toml)
    #[arg(short = 'c', long)]
    config: Option<PathBuf>,

    /// Enable verbose logging
    #[arg(long)]
    verbose: bool,
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    if cli.verbose {
        tracing_subscriber::fmt()
            .with_env_filter("spacey_loader=debug")
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter("spacey_loader=warn")
            .init();
    }

    match run(&cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}: {:#}", "Error".red().bold(), e);
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: &Cli) -> anyhow::Result<()> {
    let mut overrides = Vec::new();
    if let Some(policy) = &cli.policy {
        overrides.push(("fallback_policy", policy.as_str()));
    }
    let config = LoaderConfig::load_layers(cli.config.as_deref(), std::env::vars(), &overrides)?;

    let registry = HandlerRegistry::global();
    registry.define(["csv"], builtin::csv_handler())?;
    registry.define(["text"], builtin::text_handler())?;
    registry.define(["lines"], builtin::lines_handler())?;

    let loader = ModuleLoader::builder(config).registry(registry).build();

    let mut assertion = ImportAssertion::new(&cli.asserted_type);
    if let Some(name) = &cli.handler {
        assertion = assertion.with_handler(builtin_handler(name)?);
    }
    if let Some(encoding) = &cli.encoding {
        assertion = assertion.with_encoding(encoding);
    }

    let record = loader
        .import(&cli.path, None, assertion, ImportBindings::Dynamic)
        .await?;

    println!("{}", serde_json::to_string_pretty(&record.namespace())?);

    if cli.verbose {
        eprintln!(
            "{} {} via handler {} ({})",
            "Imported".green().bold(),
            record.cache_key().url.cyan(),
            record.handler(),
            record.origin()
        );
        eprintln!("{}", loader.stats().summary().dimmed());
    }

    Ok(())
}

fn builtin_handler(name: &str) -> anyhow::Result<Handler> {
    match name {
        "csv" => Ok(builtin::csv_handler()),
        "json" => Ok(builtin::json_handler()),
        "text" => Ok(builtin::text_handler()),
        "lines" => Ok(builtin::lines_handler()),
        other => anyhow::bail!("unknown built-in handler '{}' (expected csv, json, text or lines)", other),
    }
}
