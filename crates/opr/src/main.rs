//! opr - Oracle password repository
//!
//! Commands:
//! - create: Create the repository named by $OPRREPOS, owned by you
//! - list: Show entries (everything for the owner, your own otherwise)
//! - add <DB> <SCHEMA> <OSUSER>: Grant an os user a schema password
//! - read <DB> <SCHEMA>: Print the password granted to you
//! - modify <DB> <SCHEMA>: Change a schema password everywhere
//! - delete <DB> <SCHEMA> <OSUSER>: Revoke a grant
//! - export <FILE> / import <FILE>: Move entries between repositories
//! - crosscheck [DB]: Check stored passwords against the databases
//! - log enable <FILE> / log disable: Audit logging

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use opr::authority;
use opr::{LockPolicy, NewEntry, PlainSecret, RepoError, SecretSource, Session};
use opr_core::{current_principal, Config, Paths};
use std::path::{Path, PathBuf};
use tracing_subscriber::EnvFilter;
use zeroize::Zeroizing;

#[derive(Parser)]
#[command(name = "opr")]
#[command(about = "Oracle password repository - schema passwords for scripts, granted per os user")]
#[command(version)]
#[command(after_help = r#"ENVIRONMENT:
    OPRREPOS         Path of the repository file (required)
    OPR_AUTHORITY    Helper program that verifies and changes passwords
                     on the target database (overrides authority_command)
    RUST_LOG         Diagnostic output on stderr, e.g. RUST_LOG=opr=debug

SECURITY:
    - Only the repository owner can change or list all entries
    - Passwords are scrambled on disk; the file is mode 0600
    - Refused requests always answer "sorry :(""#)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a new, empty repository owned by you
    Create,

    /// List entries (passwords are never shown)
    List {
        /// Output as JSON for scripting
        #[arg(long)]
        json: bool,
    },

    /// Grant an os user access to a schema password
    Add {
        /// Store without logging on to the database first
        #[arg(short, long)]
        force: bool,
        /// Database (stored upper case)
        database: String,
        /// Schema (stored lower case)
        schema: String,
        /// Os user being granted access
        osuser: String,
        /// Password (omit for hidden prompt)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Print the password granted to you
    Read {
        /// Don't print trailing newline (useful for piping)
        #[arg(short = 'n')]
        no_newline: bool,
        database: String,
        schema: String,
    },

    /// Change a schema password on the database and in every entry
    Modify {
        database: String,
        schema: String,
        /// New password (omit for hidden prompt)
        #[arg(long)]
        secret: Option<String>,
    },

    /// Revoke an os user's access
    Delete {
        database: String,
        schema: String,
        osuser: String,
    },

    /// Write all entries, still scrambled, to a file
    Export {
        file: PathBuf,
    },

    /// Add entries from an export file, skipping existing ones
    Import {
        file: PathBuf,
    },

    /// Check stored passwords against the databases
    Crosscheck {
        /// Only check this database
        database: Option<String>,
    },

    /// Audit logging
    Log {
        #[command(subcommand)]
        action: LogAction,
    },
}

#[derive(Subcommand)]
enum LogAction {
    /// Log every request to FILE
    Enable { file: PathBuf },
    /// Stop logging
    Disable,
}

fn main() -> Result<()> {
    // Diagnostics go to stderr; stdout may carry a password
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let config = Config::load(&Paths::new().config_file())?;
    let repository = Paths::repository()?;
    let principal = current_principal()?;
    let policy = LockPolicy::from(&config);

    let open = || Session::open(&repository, principal.as_str(), policy);

    match cli.command {
        Commands::Create => cmd_create(&repository, &principal, policy),
        Commands::List { json } => cmd_list(&open()?, json),
        Commands::Add {
            force,
            database,
            schema,
            osuser,
            secret,
        } => cmd_add(
            &mut open()?,
            &config,
            NewEntry::new(&database, &schema, &osuser).skip_verify(force),
            secret,
        ),
        Commands::Read {
            no_newline,
            database,
            schema,
        } => cmd_read(&open()?, &database, &schema, no_newline),
        Commands::Modify {
            database,
            schema,
            secret,
        } => cmd_modify(&mut open()?, &config, &database, &schema, secret),
        Commands::Delete {
            database,
            schema,
            osuser,
        } => cmd_delete(&mut open()?, &database, &schema, &osuser),
        Commands::Export { file } => cmd_export(&open()?, &file),
        Commands::Import { file } => cmd_import(&mut open()?, &file),
        Commands::Crosscheck { database } => cmd_crosscheck(&open()?, &config, database.as_deref()),
        Commands::Log { action } => cmd_log(&mut open()?, action),
    }
}

/// Hidden prompt, asked twice
fn prompt_secret(what: &str) -> opr::Result<PlainSecret> {
    let read = |prompt: &str| {
        rpassword::prompt_password(prompt)
            .map(Zeroizing::new)
            .map_err(|e| RepoError::Config(format!("failed to read password: {}", e)))
    };

    let first = read(&format!("password for {}: ", what))?;
    let second = read("retype password: ")?;
    if *first != *second {
        return Err(RepoError::Config("passwords do not match".to_string()));
    }
    if first.is_empty() {
        return Err(RepoError::Config("empty password not allowed".to_string()));
    }
    Ok(PlainSecret::new(first.as_bytes()))
}

fn given_or_prompted(secret: Option<String>, what: &str) -> opr::Result<PlainSecret> {
    match secret.map(Zeroizing::new) {
        Some(secret) => Ok(PlainSecret::new(secret.as_bytes())),
        None => prompt_secret(what),
    }
}

fn cmd_create(repository: &Path, principal: &str, policy: LockPolicy) -> Result<()> {
    Session::create(repository, principal, policy)?;
    println!("success: Repository created: {}", repository.display());
    println!("Owner: {}", principal);
    Ok(())
}

fn cmd_list(session: &Session, json: bool) -> Result<()> {
    let listing = session.list();

    if json {
        println!("{}", serde_json::to_string_pretty(&listing)?);
        return Ok(());
    }

    if listing.privileged {
        println!("Repository: {}", listing.repository);
        println!("Owner:      {}", listing.owner.as_deref().unwrap_or_default());
        match &listing.logfile {
            Some(logfile) => println!("Logging:    enabled ({})", logfile),
            None => println!("Logging:    disabled"),
        }
        println!();
    }

    if listing.entries.is_empty() {
        println!("No entries.");
        return Ok(());
    }

    println!("{:<24} {:<20} {}", "DATABASE", "SCHEMA", "OSUSER");
    for entry in &listing.entries {
        println!("{:<24} {:<20} {}", entry.database, entry.schema, entry.osuser);
    }

    Ok(())
}

fn cmd_add(
    session: &mut Session,
    config: &Config,
    entry: NewEntry<'_>,
    secret: Option<String>,
) -> Result<()> {
    let authority = authority::from_config(config);
    let what = format!("{}/{}", entry.database, entry.schema);

    let source = session.add(entry, || given_or_prompted(secret, &what), authority.as_ref())?;

    if source == SecretSource::Reused {
        println!("info: Existing password for {} reused", what);
    }
    println!(
        "success: Entry added: ({}, {}, {})",
        entry.database.to_ascii_uppercase(),
        entry.schema.to_ascii_lowercase(),
        entry.osuser
    );
    Ok(())
}

fn cmd_read(session: &Session, database: &str, schema: &str, no_newline: bool) -> Result<()> {
    let secret = session.read(database, schema)?;
    let text = secret.to_text();

    if no_newline {
        print!("{}", text.as_str());
    } else {
        println!("{}", text.as_str());
    }
    Ok(())
}

fn cmd_modify(
    session: &mut Session,
    config: &Config,
    database: &str,
    schema: &str,
    secret: Option<String>,
) -> Result<()> {
    let authority = authority::from_config(config);
    let new_secret = given_or_prompted(secret, &format!("{}/{}", database, schema))?;

    let changed = session.modify(database, schema, &new_secret, authority.as_ref())?;
    println!("success: {} entries modified", changed);
    Ok(())
}

fn cmd_delete(session: &mut Session, database: &str, schema: &str, osuser: &str) -> Result<()> {
    session.delete(database, schema, osuser)?;
    println!("success: Entry deleted");
    Ok(())
}

fn cmd_export(session: &Session, file: &Path) -> Result<()> {
    let count = session
        .export(file)
        .with_context(|| format!("Export to {} failed", file.display()))?;

    if count == 0 {
        println!("warning: Repository is empty, nothing exported");
    } else {
        println!("success: {} entries exported to: {}", count, file.display());
    }
    Ok(())
}

fn cmd_import(session: &mut Session, file: &Path) -> Result<()> {
    if !file.exists() {
        bail!("Import file not found: {}", file.display());
    }

    let report = session
        .import(file)
        .with_context(|| format!("Import from {} failed", file.display()))?;

    for skipped in &report.skipped {
        println!("warning: Entry {} exists, skipped", skipped);
    }
    println!("success: {} entries imported", report.imported);
    Ok(())
}

fn cmd_crosscheck(session: &Session, config: &Config, database: Option<&str>) -> Result<()> {
    let authority = authority::from_config(config);
    let results = session.crosscheck(database, authority.as_ref())?;

    if results.is_empty() {
        println!("No entries to check.");
        return Ok(());
    }

    for result in &results {
        let tag = if result.valid { "[ ok ]" } else { "[fail]" };
        println!("{} {} {}", tag, result.database, result.schema);
    }

    let failed = results.iter().filter(|r| !r.valid).count();
    if failed > 0 {
        bail!("{} of {} credentials failed the crosscheck", failed, results.len());
    }
    Ok(())
}

fn cmd_log(session: &mut Session, action: LogAction) -> Result<()> {
    match action {
        LogAction::Enable { file } => {
            session.enable_logging(&file)?;
            println!("success: Logging to {}", file.display());
        }
        LogAction::Disable => {
            session.disable_logging()?;
            println!("success: Logging disabled");
        }
    }
    Ok(())
}
