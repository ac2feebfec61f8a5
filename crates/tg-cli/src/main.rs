//! Trackguard CLI
//!
//! Tools for inspecting pattern databases, compiling policy into rules and
//! editing a file-backed policy store.

use std::fs;
use std::sync::Arc;
use std::time::Instant;

use clap::{Parser, Subcommand, ValueEnum};
use log::debug;

use tg_compiler::compiler::validate_static_rules;
use tg_compiler::{parse_filter_list, plan, HostSnapshot, Origin, Rule, RuleCompiler, RulesetId};
use tg_core::{
    ExceptionScope, ExceptionStatus, PatternDatabase, PauseExpiry, PolicyState, PublicSuffixList,
    Timestamp, TrackerResolver,
};
use tg_runtime::{Clock, JsonFileStore, PolicyStore, SystemClock};

#[derive(Parser)]
#[command(name = "tg-cli")]
#[command(about = "Trackguard tracker database and rule tools")]
struct Cli {
    /// Debug logging (overridden by RUST_LOG)
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Identify the tracker behind request URLs
    Resolve {
        /// Pattern database JSON
        #[arg(short, long)]
        database: String,

        /// Public suffix list (.dat)
        #[arg(long)]
        psl: Option<String>,

        /// Hostname of the page issuing the requests
        #[arg(short, long)]
        origin: Option<String>,

        /// Request URLs
        #[arg(required = true)]
        urls: Vec<String>,
    },

    /// Compile the stored policy into host rules
    Compile {
        #[arg(short, long, default_value = "trackguard.json")]
        store: String,

        /// Pattern database JSON, for tracker exceptions
        #[arg(short, long)]
        database: Option<String>,

        /// Evaluate expiry at this time (ms since epoch) instead of now
        #[arg(long)]
        now: Option<u64>,

        /// Write the compiled rules here instead of stdout
        #[arg(short = 'O', long)]
        output: Option<String>,
    },

    /// Plan the host calls needed to reach the stored policy
    Plan {
        #[arg(short, long, default_value = "trackguard.json")]
        store: String,

        /// Host snapshot JSON (what is currently installed)
        #[arg(long)]
        snapshot: Option<String>,

        #[arg(short, long)]
        database: Option<String>,
    },

    /// Validate inputs
    Validate {
        /// Pattern database JSON
        #[arg(short, long)]
        database: Option<String>,

        /// Custom filter text
        #[arg(short, long)]
        filters: Option<String>,

        /// Bundled fixes ruleset (JSON array of rules)
        #[arg(long)]
        fixes: Option<String>,
    },

    /// Print rule ID ranges and priority bands
    Ranges,

    /// Pause blocking on a site
    Pause {
        #[arg(short, long, default_value = "trackguard.json")]
        store: String,

        host: String,

        /// Minutes until the pause expires (forever if omitted)
        #[arg(short, long)]
        minutes: Option<u64>,
    },

    /// Resume blocking on a site
    Resume {
        #[arg(short, long, default_value = "trackguard.json")]
        store: String,

        host: String,
    },

    /// Always allow top-level navigations to a host
    Allow {
        #[arg(short, long, default_value = "trackguard.json")]
        store: String,

        host: String,
    },

    /// Set or clear a tracker/host exception
    Exception {
        #[arg(short, long, default_value = "trackguard.json")]
        store: String,

        /// Tracker id or hostname
        key: String,

        #[arg(value_enum)]
        status: StatusArg,

        /// Only on this site
        #[arg(long)]
        site: Option<String>,
    },
}

#[derive(Clone, Copy, ValueEnum)]
enum StatusArg {
    Trusted,
    Blocked,
    Clear,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let default_level = if cli.verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level)).init();

    let result = match cli.command {
        Commands::Resolve {
            database,
            psl,
            origin,
            urls,
        } => cmd_resolve(&database, psl.as_deref(), origin.as_deref(), &urls),
        Commands::Compile {
            store,
            database,
            now,
            output,
        } => cmd_compile(&store, database.as_deref(), now, output.as_deref()).await,
        Commands::Plan {
            store,
            snapshot,
            database,
        } => cmd_plan(&store, snapshot.as_deref(), database.as_deref()).await,
        Commands::Validate {
            database,
            filters,
            fixes,
        } => cmd_validate(database.as_deref(), filters.as_deref(), fixes.as_deref()),
        Commands::Ranges => {
            cmd_ranges();
            Ok(())
        }
        Commands::Pause {
            store,
            host,
            minutes,
        } => cmd_pause(&store, &host, minutes).await,
        Commands::Resume { store, host } => cmd_resume(&store, &host).await,
        Commands::Allow { store, host } => cmd_allow(&store, &host).await,
        Commands::Exception {
            store,
            key,
            status,
            site,
        } => cmd_exception(&store, &key, status, site).await,
    };

    if let Err(e) = result {
        eprintln!("Error: {e}");
        std::process::exit(1);
    }
}

fn read_file(path: &str) -> Result<String, String> {
    fs::read_to_string(path).map_err(|e| format!("Failed to read '{}': {}", path, e))
}

fn load_database(path: &str) -> Result<PatternDatabase, String> {
    let start = Instant::now();
    let database = PatternDatabase::from_json(&read_file(path)?)
        .map_err(|e| format!("Invalid pattern database '{}': {}", path, e))?;
    debug!(
        "Loaded {} trackers from '{}' in {:.1}ms",
        database.tracker_count(),
        path,
        start.elapsed().as_secs_f64() * 1000.0
    );
    Ok(database)
}

fn open_store(path: &str) -> PolicyStore {
    PolicyStore::new(Arc::new(JsonFileStore::new(path)), Arc::new(SystemClock))
}

async fn compile_from_store(
    store: &str,
    database: Option<&str>,
    now: Timestamp,
) -> Result<tg_compiler::CompiledRules, String> {
    let state = open_store(store)
        .load()
        .await
        .map_err(|e| format!("Failed to load policy from '{}': {}", store, e))?;
    let database = database.map(load_database).transpose()?.map(Arc::new);
    Ok(RuleCompiler::new(database).compile(&state, now))
}

fn cmd_resolve(database: &str, psl: Option<&str>, origin: Option<&str>, urls: &[String]) -> Result<(), String> {
    let database = load_database(database)?;
    let psl = match psl {
        Some(path) => PublicSuffixList::from_text(&read_file(path)?),
        None => PublicSuffixList::default(),
    };
    let resolver = TrackerResolver::new(Some(Arc::new(database)), Arc::new(psl));

    for url in urls {
        match resolver.resolve(url, origin) {
            Some(found) => println!(
                "{}  {} ({}) [{}] via {:?}",
                url,
                found.tracker.name,
                found.tracker.id,
                found.category.map(|c| c.name).unwrap_or_else(|| "uncategorized".to_string()),
                found.layer
            ),
            None => println!("{}  -", url),
        }
    }

    Ok(())
}

async fn cmd_compile(store: &str, database: Option<&str>, now: Option<u64>, output: Option<&str>) -> Result<(), String> {
    let now = now.unwrap_or_else(|| SystemClock.now());
    let compiled = compile_from_store(store, database, now).await?;
    let json = compiled
        .to_json()
        .map_err(|e| format!("Failed to serialize rules: {}", e))?;

    match output {
        Some(path) => {
            fs::write(path, &json).map_err(|e| format!("Failed to write '{}': {}", path, e))?;
            println!("Compiled policy from '{}' to '{}'", store, path);
            println!("  Rulesets: {}", compiled.enabled_rulesets.len());
            for (origin, rules) in &compiled.by_origin {
                println!("  {:<26} {} rules", origin.as_str(), rules.len());
            }
            for issue in &compiled.issues {
                println!("  Issue: {}", issue);
            }
        }
        None => println!("{json}"),
    }

    Ok(())
}

async fn cmd_plan(store: &str, snapshot: Option<&str>, database: Option<&str>) -> Result<(), String> {
    let compiled = compile_from_store(store, database, SystemClock.now()).await?;
    let actual: HostSnapshot = match snapshot {
        Some(path) => serde_json::from_str(&read_file(path)?)
            .map_err(|e| format!("Invalid host snapshot '{}': {}", path, e))?,
        None => HostSnapshot::default(),
    };

    let plan = plan(&compiled.into_desired(Vec::new()), &actual);
    let json = serde_json::to_string_pretty(&plan).map_err(|e| format!("Failed to serialize plan: {}", e))?;
    println!("{json}");
    Ok(())
}

fn cmd_validate(database: Option<&str>, filters: Option<&str>, fixes: Option<&str>) -> Result<(), String> {
    if database.is_none() && filters.is_none() && fixes.is_none() {
        return Err("Nothing to validate; pass --database, --filters or --fixes".to_string());
    }

    let mut problems = 0usize;

    if let Some(path) = database {
        let db = load_database(path)?;
        let invalid = db.invalid_regexes();
        println!("Pattern database '{}'", path);
        println!("  Version:   {}", db.version());
        println!("  Trackers:  {}", db.tracker_count());
        println!("  Paths:     {}", db.paths().len());
        println!("  Regexes:   {} ({} invalid)", db.regexes().len(), invalid.len());
        for pattern in &invalid {
            println!("    invalid: {}", pattern);
        }
        problems += invalid.len();
    }

    if let Some(path) = filters {
        let parsed = parse_filter_list(&read_file(path)?);
        println!("Custom filters '{}'", path);
        println!("  Network:   {}", parsed.network.len());
        println!("  Cosmetic:  {}", parsed.cosmetic.len());
        println!("  Errors:    {}", parsed.errors.len());
        for error in &parsed.errors {
            println!("    {}", error);
        }
        problems += parsed.errors.len();
    }

    if let Some(path) = fixes {
        let rules: Vec<Rule> = serde_json::from_str(&read_file(path)?)
            .map_err(|e| format!("Invalid ruleset '{}': {}", path, e))?;
        let issues = validate_static_rules(RulesetId::Fixes, &rules);
        println!("Fixes ruleset '{}': {} rules, {} issues", path, rules.len(), issues.len());
        for issue in &issues {
            println!("    {}", issue);
        }
        problems += issues.len();
    }

    if problems > 0 {
        return Err(format!("{} problems found", problems));
    }
    Ok(())
}

fn cmd_ranges() {
    use tg_compiler::priority::*;

    println!("Rule ID ranges:");
    for origin in Origin::ALL {
        let range = origin.id_range();
        println!("  {:<26} {:>9} - {:>9}", origin.as_str(), range.start, range.end);
    }
    println!();
    println!("Priority bands:");
    for (name, value) in [
        ("pause", PAUSE),
        ("exception (site)", EXCEPTION_SITE),
        ("exception (global)", EXCEPTION_GLOBAL),
        ("redirect protection (once)", REDIRECT_PROTECTION_SESSION),
        ("redirect protection", REDIRECT_PROTECTION),
        ("custom filter !important @@", CUSTOM_FILTER_IMPORTANT_ALLOW),
        ("custom filter !important", CUSTOM_FILTER_IMPORTANT),
        ("custom filter @@", CUSTOM_FILTER_ALLOW),
        ("custom filter", CUSTOM_FILTER),
        ("static lists (max)", BASELINE_MAX),
    ] {
        println!("  {:<28} {:>9}", name, value);
    }
}

async fn update_store<F>(store: &str, merge: F) -> Result<PolicyState, String>
where
    F: FnOnce(&mut PolicyState),
{
    let (state, revision) = open_store(store)
        .update(merge)
        .await
        .map_err(|e| format!("Failed to update '{}': {}", store, e))?;
    debug!("Wrote revision {} to '{}'", revision, store);
    Ok(state)
}

async fn cmd_pause(store: &str, host: &str, minutes: Option<u64>) -> Result<(), String> {
    let expiry = pause_expiry(SystemClock.now(), minutes)?;
    let state = update_store(store, |s| s.pause(host, expiry)).await?;
    println!("Paused {} ({} sites paused)", host, state.paused.len());
    Ok(())
}

fn pause_expiry(now: Timestamp, minutes: Option<u64>) -> Result<PauseExpiry, String> {
    let Some(minutes) = minutes else {
        return Ok(PauseExpiry::Forever);
    };
    minutes
        .checked_mul(60 * 1000)
        .and_then(|ms| now.checked_add(ms))
        .map(PauseExpiry::Until)
        .ok_or_else(|| format!("Pause of {} minutes is too long", minutes))
}

async fn cmd_resume(store: &str, host: &str) -> Result<(), String> {
    let mut removed = false;
    update_store(store, |s| removed = s.resume(host)).await?;
    if !removed {
        return Err(format!("{} is not paused", host));
    }
    println!("Resumed {}", host);
    Ok(())
}

async fn cmd_allow(store: &str, host: &str) -> Result<(), String> {
    let state = update_store(store, |s| {
        s.disable_redirect_protection_for(host);
    })
    .await?;
    println!(
        "Redirect protection off for {} ({} hosts always allowed)",
        host,
        state.redirect_protection.disabled.len()
    );
    Ok(())
}

async fn cmd_exception(store: &str, key: &str, status: StatusArg, site: Option<String>) -> Result<(), String> {
    let scope = match site {
        Some(site) => ExceptionScope::Site(site),
        None => ExceptionScope::Global,
    };
    update_store(store, |s| match status {
        StatusArg::Trusted => s.set_exception(key, scope, ExceptionStatus::Trusted),
        StatusArg::Blocked => s.set_exception(key, scope, ExceptionStatus::Blocked),
        StatusArg::Clear => s.clear_exception(key, scope),
    })
    .await?;
    println!("Exception for {} updated", key);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn pause_expiry_rejects_overflow() {
        assert_eq!(pause_expiry(1_000, None), Ok(PauseExpiry::Forever));
        assert_eq!(pause_expiry(1_000, Some(2)), Ok(PauseExpiry::Until(121_000)));
        assert!(pause_expiry(1_000, Some(u64::MAX / 1_000)).is_err());
        assert!(pause_expiry(u64::MAX - 10, Some(1)).is_err());
    }
}
