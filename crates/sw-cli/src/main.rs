//! Scriptward CLI
//!
//! Tools for testing match rules and working with a script database dumped
//! as a flat JSON object of storage keys.

mod http;

use std::fs;
use std::path::Path;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use serde_json::json;

use sw_core::{matcher, Blacklist};
use sw_inject::{Assembler, AssemblerConfig, Injection, Manager, Notification, Notifier};
use sw_store::{Fetcher, InstallSource, MemoryStorage, NoFetch, ScriptStore, StoreConfig};

use crate::http::HttpFetcher;

#[derive(Parser)]
#[command(name = "sw")]
#[command(about = "Scriptward userscript manager tools")]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Test a URL against @match (or @include) rules
    Match {
        #[arg(short, long)]
        url: String,

        /// Rules to test
        #[arg(short, long, required = true)]
        rule: Vec<String>,

        /// Use @include glob syntax
        #[arg(short, long)]
        glob: bool,
    },

    /// Install a .user.js file into a database
    Install {
        /// Database dump (created if missing)
        #[arg(long)]
        db: String,

        /// Userscript file
        #[arg(short, long)]
        file: String,

        /// URL the script was downloaded from, base for relative @require
        #[arg(long)]
        url: Option<String>,

        /// Do not download dependencies
        #[arg(long)]
        offline: bool,
    },

    /// Show what a frame at URL would receive
    Inject {
        #[arg(long)]
        db: String,

        #[arg(short, long)]
        url: String,

        /// Assemble for a subframe instead of the top frame
        #[arg(long)]
        subframe: bool,

        /// Assume the page realm handshake failed
        #[arg(long)]
        no_page_realm: bool,

        /// Blacklist file to apply
        #[arg(long)]
        blacklist: Option<String>,

        /// Default realm for scripts without @inject-into
        #[arg(long, default_value = "auto")]
        inject_into: String,
    },

    /// Remove unreferenced data and refetch missing resources
    Vacuum {
        #[arg(long)]
        db: String,

        /// Only report missing resources
        #[arg(long)]
        offline: bool,
    },

    /// List installed scripts
    List {
        #[arg(long)]
        db: String,
    },

    /// Test URLs against a blacklist file
    Blacklist {
        #[arg(short, long)]
        list: String,

        #[arg(short, long, required = true)]
        url: Vec<String>,
    },
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let result = match cli.command {
        Commands::Match { url, rule, glob } => cmd_match(&url, &rule, glob),
        Commands::Install {
            db,
            file,
            url,
            offline,
        } => cmd_install(&db, &file, url, offline).await,
        Commands::Inject {
            db,
            url,
            subframe,
            no_page_realm,
            blacklist,
            inject_into,
        } => {
            cmd_inject(&db, &url, !subframe, !no_page_realm, blacklist.as_deref(), &inject_into).await
        }
        Commands::Vacuum { db, offline } => cmd_vacuum(&db, offline).await,
        Commands::List { db } => cmd_list(&db).await,
        Commands::Blacklist { list, url } => cmd_blacklist(&list, &url),
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

// =============================================================================
// Database helpers
// =============================================================================

/// Prints missing-resource notifications to stderr.
struct StderrNotifier;

impl Notifier for StderrNotifier {
    fn notify(&self, notification: Notification) {
        eprintln!("{}\n{}", notification.title, notification.body);
    }
}

fn read_db(path: &str) -> Result<Arc<MemoryStorage>, String> {
    if !Path::new(path).exists() {
        return Ok(Arc::new(MemoryStorage::new()));
    }
    let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
    let json = serde_json::from_str(&text).map_err(|e| format!("Invalid JSON in '{}': {}", path, e))?;
    let storage = MemoryStorage::from_json(json).map_err(|e| format!("Invalid database '{}': {}", path, e))?;
    Ok(Arc::new(storage))
}

fn write_db(path: &str, storage: &MemoryStorage) -> Result<(), String> {
    let text = serde_json::to_string_pretty(&storage.to_json())
        .map_err(|e| format!("Failed to serialize database: {}", e))?;
    fs::write(path, text).map_err(|e| format!("Failed to write '{}': {}", path, e))
}

fn fetcher(offline: bool) -> Result<Arc<dyn Fetcher>, String> {
    if offline {
        Ok(Arc::new(NoFetch))
    } else {
        Ok(Arc::new(HttpFetcher::new()?))
    }
}

async fn open(
    db: &str,
    fetcher: Arc<dyn Fetcher>,
    config: AssemblerConfig,
) -> Result<(Manager, Arc<MemoryStorage>), String> {
    let storage = read_db(db)?;
    let store = ScriptStore::new(storage.clone(), fetcher, StoreConfig::default());
    let mut manager = Manager::new(store, Assembler::new(config, Arc::new(StderrNotifier)));
    let report = manager.load().await.map_err(|e| e.to_string())?;
    for url in &report.missing {
        eprintln!("Missing resource: {url}");
    }
    Ok((manager, storage))
}

// =============================================================================
// Commands
// =============================================================================

fn cmd_match(url: &str, rules: &[String], glob: bool) -> Result<(), String> {
    let mut matched = 0usize;
    for rule in rules {
        let hit = if glob {
            matcher::matches_glob(url, rule)
        } else {
            matcher::matches_rule(url, rule)
        };
        if hit {
            matched += 1;
        }
        println!("  {}  {}", if hit { "match" } else { "-    " }, rule);
    }
    println!("{matched}/{} rules match {url}", rules.len());
    Ok(())
}

async fn cmd_install(db: &str, file: &str, url: Option<String>, offline: bool) -> Result<(), String> {
    let code = fs::read_to_string(file).map_err(|e| format!("Failed to read '{}': {}", file, e))?;
    let (mut manager, storage) = open(db, fetcher(offline)?, AssemblerConfig::default()).await?;

    let outcome = manager
        .install(
            &code,
            InstallSource {
                url,
                ..InstallSource::default()
            },
        )
        .await
        .map_err(|e| e.to_string())?;
    let name = manager
        .store()
        .get_script(outcome.id)
        .map(|script| script.name())
        .unwrap_or_default();
    println!(
        "{} #{} {}",
        if outcome.is_new { "Installed" } else { "Updated" },
        outcome.id,
        name
    );
    for error in &outcome.rule_errors {
        println!("  warning: {error}");
    }
    if let Some(error) = &outcome.fetch_error {
        println!("  {error}");
    }

    write_db(db, &storage)
}

fn print_injection(label: &str, injection: &Injection) -> Result<(), String> {
    let content: Vec<u64> = injection.content.iter().map(|script| script.id).collect();
    let summary = json!({
        "payload": injection.payload,
        "feedback": injection.feedback,
        "failedIds": injection.failed_ids,
        "content": content,
    });
    let text = serde_json::to_string_pretty(&summary).map_err(|e| format!("Failed to serialize {label}: {}", e))?;
    println!("{label}: {text}");
    Ok(())
}

async fn cmd_inject(
    db: &str,
    url: &str,
    is_top: bool,
    page_available: bool,
    blacklist: Option<&str>,
    inject_into: &str,
) -> Result<(), String> {
    let mut config = AssemblerConfig::default();
    config.set_default_inject_into(inject_into);
    let (mut manager, storage) = open(db, fetcher(false)?, config).await?;
    if let Some(path) = blacklist {
        let text = fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))?;
        manager.set_blacklist(&text);
    }

    let injection = manager.get_injected(url, is_top, page_available).await;
    print_injection("early", &injection)?;
    if let Some(more) = injection.payload.more.as_deref() {
        let delayed = manager
            .get_more(more, page_available)
            .await
            .map_err(|e| e.to_string())?;
        print_injection("delayed", &delayed)?;
    }

    write_db(db, &storage)
}

async fn cmd_vacuum(db: &str, offline: bool) -> Result<(), String> {
    let (manager, storage) = open(db, fetcher(offline)?, AssemblerConfig::default()).await?;
    let report = manager.vacuum().await;

    println!("Vacuumed '{}'", db);
    println!("  Fixes:    {}", report.fixes);
    for error in &report.errors {
        println!("  Error:    {error}");
    }
    for missing in &report.missing {
        println!("  Missing:  {missing}");
    }

    let total: u64 = manager
        .store()
        .sizes()
        .iter()
        .map(|(_, s)| s.code + s.record + s.values + s.requires + s.resources)
        .sum();
    println!("  Size:     {} bytes ({:.1} KB)", total, total as f64 / 1024.0);
    write_db(db, &storage)
}

async fn cmd_list(db: &str) -> Result<(), String> {
    let (manager, _) = open(db, Arc::new(NoFetch), AssemblerConfig::default()).await?;
    let info = manager.store().info();
    println!("{} scripts (next id {})", manager.store().all().len(), info.id + 1);
    for script in manager.store().all() {
        let state = if script.config.removed {
            "removed"
        } else if script.config.enabled {
            "enabled"
        } else {
            "disabled"
        };
        println!(
            "  #{:<4} {:>3}  {:<8} {:<5} {}",
            script.id(),
            script.props.position,
            state,
            script.run_at().as_str(),
            script.name()
        );
    }
    Ok(())
}

fn cmd_blacklist(list: &str, urls: &[String]) -> Result<(), String> {
    let text = fs::read_to_string(list).map_err(|e| format!("Failed to read '{}': {}", list, e))?;
    let blacklist = Blacklist::new(&text);
    println!("Blacklist '{}': {} rules", list, blacklist.rule_count());
    for url in urls {
        match blacklist.test(url) {
            Some(rule) => println!("  blocked  {url}  ({rule})"),
            None => println!("  allowed  {url}"),
        }
    }
    Ok(())
}
