/*
 * depforge - Koji builds with automatic dependency resolution.
 * Copyright (C) 2025  depforge contributors
 *
 * This program is free software: you can redistribute it and/or modify
 * it under the terms of the GNU General Public License as published by
 * the Free Software Foundation, either version 3 of the License, or
 * (at your option) any later version.
 *
 * This program is distributed in the hope that it will be useful,
 * but WITHOUT ANY WARRANTY; without even the implied warranty of
 * MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
 * GNU General Public License for more details.
 *
 * You should have received a copy of the GNU General Public License
 * along with this program.  If not, see <https://www.gnu.org/licenses/>.
 */
#![allow(dead_code)]

use clap::Parser;
use comfy_table::{presets::UTF8_FULL, Cell, Color, ContentArrangement, Table};
use console::style;
use std::path::{Path, PathBuf};
use std::sync::atomic::Ordering;
use std::sync::Arc;
use tracing::{error, info};

mod build;
mod config;
mod error;
mod fetch;
mod koji;
mod logging;
mod resolve;
mod spec;

use build::{BuildOrchestrator, BuildResult, OrchestratorOptions};
use config::{Config, NameResolutionMode};
use error::{DepforgeError, DepforgeResult};
use fetch::SrpmFetcher;
use koji::{BuildStatus, Hub, KojiClient};
use resolve::{MlResolver, NameResolver};

const VERSION: &str = env!("CARGO_PKG_VERSION");
const LONG_VERSION: &str = concat!(
    env!("CARGO_PKG_VERSION"),
    "\n",
    "Copyright (C) 2025  depforge contributors\n",
    "License GPLv3+: GNU GPL version 3 or later <https://gnu.org/licenses/gpl.html>\n\n",
    "This is free software; you are free to change and redistribute it.\n",
    "There is NO WARRANTY, to the extent permitted by law."
);

#[derive(Parser)]
#[command(name = "depforge")]
#[command(version = VERSION)]
#[command(long_version = LONG_VERSION)]
#[command(about = "Koji builds with automatic dependency resolution.")]
#[command(
    after_help = "SRPM can be a path to a .src.rpm file or a package name; \
a bare name is downloaded from Koji first.\n\n\
Examples:\n  \
depforge fedora-target my-package-1.0-1.fc40.src.rpm\n  \
depforge --scratch fedora-target python-requests\n  \
depforge --analyze-only my-package.src.rpm\n  \
depforge --download-only python-requests"
)]
struct Cli {
    #[arg(short, long, help = "Enable verbose output")]
    verbose: bool,

    #[arg(short, long, help = "Suppress non-error output")]
    quiet: bool,

    // Modes
    #[arg(long, help = "Only analyze dependencies, do not build")]
    analyze_only: bool,

    #[arg(long, help = "Only download the SRPM, do not build")]
    download_only: bool,

    #[arg(long, help = "Show what would be built without building")]
    dry_run: bool,

    // Koji options
    #[arg(long, value_name = "URL", help = "Koji hub URL")]
    server: Option<String>,

    #[arg(long, value_name = "URL", help = "Koji web URL")]
    web_url: Option<String>,

    #[arg(long, value_name = "FILE", help = "Client certificate for authentication")]
    cert: Option<PathBuf>,

    #[arg(long, value_name = "FILE", help = "CA certificate for server verification")]
    serverca: Option<PathBuf>,

    #[arg(long, value_name = "TAG", help = "Build tag for dependency checking")]
    build_tag: Option<String>,

    #[arg(long, help = "Disable SSL certificate verification (insecure)")]
    no_ssl_verify: bool,

    // Build options
    #[arg(long, help = "Perform scratch build (not tagged)")]
    scratch: bool,

    #[arg(long, help = "Do not wait for builds to complete")]
    nowait: bool,

    #[arg(long, help = "Skip dependency resolution, just build the package")]
    no_deps: bool,

    #[arg(long, value_name = "DIR", help = "Directory for downloaded SRPMs")]
    download_dir: Option<PathBuf>,

    #[arg(long, value_name = "N", help = "Concurrent builds per level")]
    max_parallel: Option<usize>,

    // Name resolution options
    #[arg(long, help = "Disable package name normalization")]
    no_name_resolution: bool,

    #[arg(long, help = "Disable similarity-based name resolution")]
    no_ml: bool,

    #[arg(long, value_name = "PATH", help = "Path to the similarity model file")]
    ml_model: Option<PathBuf>,

    // Maintenance
    #[arg(
        long,
        value_name = "JSON",
        help = "Train the similarity model from JSON examples and write it to --ml-model"
    )]
    train_ml: Option<PathBuf>,

    #[arg(long, help = "Remove the SRPM cache directory and exit")]
    clean_cache: bool,

    #[arg(value_name = "TARGET", help = "Build target (e.g. fedora-target)")]
    target: Option<String>,

    #[arg(
        value_name = "SRPM",
        help = "Path to .src.rpm or package name; a name is downloaded first"
    )]
    srpm: Option<String>,
}

impl Cli {
    /// Fold command-line flags into the layered configuration
    fn apply_to(&self, config: &mut Config) {
        if let Some(server) = &self.server {
            config.koji.server = server.clone();
        }
        if let Some(web_url) = &self.web_url {
            config.koji.web_url = web_url.clone();
        }
        if let Some(cert) = &self.cert {
            config.koji.cert = Some(cert.clone());
        }
        if let Some(serverca) = &self.serverca {
            config.koji.serverca = Some(serverca.clone());
        }
        if let Some(tag) = &self.build_tag {
            config.koji.build_tag = tag.clone();
        }
        if let Some(target) = &self.target {
            config.koji.target = target.clone();
        }
        if self.no_ssl_verify {
            config.koji.no_ssl_verify = true;
        }
        if self.scratch {
            config.build.scratch = true;
        }
        if self.nowait {
            config.build.no_wait = true;
        }
        if let Some(n) = self.max_parallel {
            config.build.max_parallel_per_level = n;
        }
        if let Some(dir) = &self.download_dir {
            config.fetch.download_dir = Some(dir.clone());
        }
        if self.no_name_resolution {
            config.resolver.name_resolution = NameResolutionMode::Off;
        } else if self.no_ml && config.resolver.name_resolution == NameResolutionMode::RulesMl {
            config.resolver.name_resolution = NameResolutionMode::RulesOnly;
        }
        if let Some(model) = &self.ml_model {
            config.resolver.ml_model_path = Some(model.clone());
        }
    }
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();

    let mut config = Config::load();
    cli.apply_to(&mut config);

    let level = if cli.quiet {
        "warn"
    } else if cli.verbose {
        "debug"
    } else {
        config.logging.level.as_str()
    };
    logging::init_with_file(level, config.logging.file.as_deref());

    if let Err(message) = config.validate() {
        error!("invalid configuration: {}", message);
        std::process::exit(1);
    }

    std::process::exit(run(cli, config).await);
}

async fn run(cli: Cli, config: Config) -> i32 {
    if let Some(data_path) = &cli.train_ml {
        return exit_code(cmd_train(data_path, cli.ml_model.as_deref()));
    }

    if cli.clean_cache {
        return exit_code(cmd_clean_cache(&config).await);
    }

    if cli.analyze_only {
        let Some(srpm) = cli.srpm.as_deref().or(cli.target.as_deref()) else {
            error!("--analyze-only requires an SRPM path");
            return 1;
        };
        return exit_code(cmd_analyze(Path::new(srpm), &config));
    }

    if cli.download_only {
        let Some(package) = cli.srpm.as_deref().or(cli.target.as_deref()) else {
            error!("--download-only requires a package name");
            return 1;
        };
        return exit_code(cmd_download(package, &config).await);
    }

    let (Some(_), Some(srpm_arg)) = (&cli.target, &cli.srpm) else {
        error!("TARGET and SRPM (or package name) are required for building");
        return 1;
    };

    let srpm_path = match ensure_srpm_path(srpm_arg, &config).await {
        Ok(path) => path,
        Err(e) => {
            error!("{}", e);
            return e.exit_code();
        }
    };

    exit_code(cmd_build(&srpm_path, &cli, &config).await)
}

fn exit_code(result: DepforgeResult<i32>) -> i32 {
    match result {
        Ok(code) => code,
        Err(e) => {
            error!("{}", e);
            e.exit_code()
        }
    }
}

/// Build the canonicalizer configured for this run
fn create_name_resolver(config: &Config) -> Arc<NameResolver> {
    let ml = match config.resolver.name_resolution {
        NameResolutionMode::RulesMl => {
            let resolver = MlResolver::new(config.resolver.ml_model_path.as_deref());
            if resolver.available() {
                Some(resolver)
            } else {
                info!("similarity model unavailable; using rules only");
                None
            }
        }
        _ => None,
    };

    Arc::new(NameResolver::new(config.resolver.name_resolution, ml))
}

/// Return a local SRPM path, downloading by package name if needed
async fn ensure_srpm_path(srpm_arg: &str, config: &Config) -> DepforgeResult<PathBuf> {
    let path = Path::new(srpm_arg);
    if path.exists() {
        return Ok(path.to_path_buf());
    }

    info!("downloading SRPM for: {}", srpm_arg);
    let names = create_name_resolver(config);
    let fetcher = SrpmFetcher::from_config(config, names)?;
    fetcher.fetch(srpm_arg, None).await
}

/// Re-train the similarity model from a JSON example file
fn cmd_train(data_path: &Path, model_path: Option<&Path>) -> DepforgeResult<i32> {
    let Some(model_path) = model_path else {
        error!("--train-ml requires --ml-model for the output path");
        return Ok(1);
    };

    let content = std::fs::read_to_string(data_path)
        .map_err(|e| DepforgeError::io(data_path.display().to_string(), e))?;
    let examples: Vec<resolve::ml::TrainingExample> =
        serde_json::from_str(&content).map_err(|e| DepforgeError::Config {
            message: format!("invalid training data: {}", e),
        })?;

    println!("Training on {} examples...", examples.len());

    let mut resolver = MlResolver::with_cache_file(std::env::temp_dir().join("depforge-train.json"));
    resolver.train(examples)?;
    resolver.save(model_path)?;

    println!(
        "{} model written to {}",
        style("ok:").green().bold(),
        model_path.display()
    );
    Ok(0)
}

/// Wipe the SRPM cache directory
async fn cmd_clean_cache(config: &Config) -> DepforgeResult<i32> {
    let names = create_name_resolver(config);
    let fetcher = SrpmFetcher::from_config(config, names)?;

    let dir = fetcher.download_dir().to_path_buf();
    fetcher.cleanup().await?;
    println!("{} removed {}", style("ok:").green().bold(), dir.display());
    Ok(0)
}

/// Parse an SRPM and report which BuildRequires the hub is missing
fn cmd_analyze(srpm_path: &Path, config: &Config) -> DepforgeResult<i32> {
    println!("Analyzing: {}", srpm_path.display());

    let info = spec::srpm::package_info(srpm_path)?;
    println!();
    println!("Package: {}", style(&info.name).cyan());
    println!("Version: {}", info.version);
    println!("Release: {}", info.release);
    println!("NVR:     {}", info.nvr());

    println!();
    println!("BuildRequires ({}):", info.build_requires.len());
    for req in &info.build_requires {
        println!("  - {}", req);
    }

    println!();
    println!("Checking availability in tag '{}'...", config.koji.build_tag);

    let client = KojiClient::new(&config.koji);
    let names = create_name_resolver(config);
    let tagged = client.list_tagged_builds(&config.koji.build_tag)?;

    let mut missing = Vec::new();
    for req in &info.build_requires {
        let canonical = names.resolve(&req.name);
        let present = client.package_exists(&canonical, &config.koji.build_tag)?
            || (canonical != req.name
                && client.package_exists(&req.name, &config.koji.build_tag)?);
        if present {
            if let Some(nvr) = tagged.get(&canonical).or_else(|| tagged.get(&req.name)) {
                println!("  {} {} ({})", style("+").green(), canonical, style(nvr).dim());
            } else {
                println!("  {} {}", style("+").green(), canonical);
            }
        } else {
            missing.push(canonical);
        }
    }

    println!();
    if missing.is_empty() {
        println!("{} all dependencies available", style("ok:").green().bold());
    } else {
        println!("Missing dependencies ({}):", missing.len());
        for dep in &missing {
            println!("  {} {}", style("x").red(), dep);
        }
    }

    Ok(0)
}

/// Download an SRPM by package name and print its path
async fn cmd_download(package: &str, config: &Config) -> DepforgeResult<i32> {
    println!("Downloading SRPM for: {}", package);

    let names = create_name_resolver(config);
    let fetcher = SrpmFetcher::from_config(config, names)?;
    let path = fetcher.fetch(package, None).await?;

    println!("{} {}", style("downloaded:").green().bold(), path.display());
    Ok(0)
}

/// Build with dependency resolution (or without, per flags)
async fn cmd_build(srpm_path: &Path, cli: &Cli, config: &Config) -> DepforgeResult<i32> {
    let names = create_name_resolver(config);
    let fetcher = Arc::new(SrpmFetcher::from_config(config, names.clone())?);
    let hub: Arc<dyn Hub> = Arc::new(KojiClient::new(&config.koji));

    let orchestrator = BuildOrchestrator::new(
        hub,
        fetcher,
        names,
        &config.koji.target,
        &config.koji.build_tag,
        OrchestratorOptions::from_config(config),
    );

    if cli.dry_run {
        return cmd_dry_run(&orchestrator, srpm_path, cli.no_deps).await;
    }

    // First interrupt stops new submissions and cancels running tasks
    let cancel = orchestrator.cancel_flag();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!();
            eprintln!("{} interrupt received, canceling builds...", style("::").yellow().bold());
            cancel.store(true, Ordering::SeqCst);
        }
    });

    let result = if cli.no_deps {
        orchestrator.build_single(srpm_path).await?
    } else {
        orchestrator.build_with_deps(srpm_path).await?
    };

    print_build_result(&result, config);
    Ok(if result.success { 0 } else { 1 })
}

/// Print the build plan without submitting anything
async fn cmd_dry_run(
    orchestrator: &BuildOrchestrator,
    srpm_path: &Path,
    no_deps: bool,
) -> DepforgeResult<i32> {
    println!("{} dry run, nothing will be built", style("::").cyan().bold());
    println!();

    let info = spec::srpm::package_info(srpm_path)?;
    println!("Target package: {}", style(&info.nvr()).yellow().bold());

    if no_deps {
        return Ok(0);
    }

    let mut graph = orchestrator.resolve_graph(&info, srpm_path).await?;
    let chain = graph.build_chain()?;

    let available: Vec<&str> = graph
        .nodes()
        .filter(|n| n.is_available)
        .map(|n| n.name.as_str())
        .collect();
    if !available.is_empty() {
        println!("Already available: {}", style(available.join(", ")).dim());
    }

    println!();
    println!("Build order ({} packages):", graph.missing().len());

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec![
        Cell::new("Level").fg(Color::Cyan),
        Cell::new("Packages").fg(Color::Cyan),
    ]);

    for (index, level) in chain.iter().enumerate() {
        table.add_row(vec![
            Cell::new(format!("{}", index + 1)),
            Cell::new(level.join(", ")),
        ]);
    }

    println!("{}", table);
    Ok(0)
}

/// Final summary in the style of the rest of the output
fn print_build_result(result: &BuildResult, config: &Config) {
    println!();
    println!(
        "{} {}",
        style("::").cyan().bold(),
        style("Build Summary").white().bold()
    );

    let status = if result.success {
        style("SUCCESS").green().bold()
    } else {
        style("FAILED").red().bold()
    };
    println!("   Status: {}", status);
    println!("   Total time: {:.1}s", result.total_seconds);
    println!("   Built: {}", result.built_packages.len());
    println!("   Failed: {}", result.failed_packages.len());

    if !result.tasks.is_empty() {
        let mut table = Table::new();
        table.load_preset(UTF8_FULL);
        table.set_content_arrangement(ContentArrangement::Dynamic);
        table.set_header(vec![
            Cell::new("Package").fg(Color::Cyan),
            Cell::new("Status").fg(Color::Cyan),
            Cell::new("Task").fg(Color::Cyan),
        ]);

        for task in &result.tasks {
            let color = match task.status {
                BuildStatus::Complete => Color::Green,
                BuildStatus::Failed => Color::Red,
                BuildStatus::Canceled => Color::Yellow,
                _ => Color::White,
            };
            table.add_row(vec![
                Cell::new(&task.package_name),
                Cell::new(task.status.to_string()).fg(color),
                Cell::new(
                    task.task_id
                        .map(|id| id.to_string())
                        .unwrap_or_else(|| "-".to_string()),
                ),
            ]);
        }

        println!("{}", table);
    }

    for task in &result.tasks {
        if let Some(message) = &task.error_message {
            println!(
                "   {} {}: {}",
                style("!").red().bold(),
                task.package_name,
                message
            );
        }
        if let Some(task_id) = task.task_id {
            println!(
                "     {}/taskinfo?taskID={}",
                style(&config.koji.web_url).dim(),
                task_id
            );
        }
    }
}
