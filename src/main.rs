mod calendar;
mod config;
mod db;
mod error;
mod extract;
mod lifecycle;
mod models;
mod promoter;
mod schema;
mod tui;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use config::{Config, ConfigArgs};
use db::{ApplicationFilter, Database};
use error::TrackerError;
use lifecycle::InterviewEntry;
use models::{ApplicationInput, Difficulty, ProfileFields, Status};
use promoter::InterviewSlot;
use std::path::PathBuf;
use std::process::ExitCode;
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "jobtrack")]
#[command(about = "Track job applications, follow-ups and interviews")]
struct Cli {
    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create or upgrade the database
    Init,

    /// Record a new application
    Add {
        /// Company name
        company: String,

        /// Role applied for
        role: String,

        /// Job location
        location: String,

        /// Link to the job posting (http or https)
        link: String,

        /// Initial status (Applied, Interview, Rejected, Offer)
        #[arg(short, long, default_value = "Applied")]
        status: String,

        /// Date applied, YYYY-MM-DD (defaults to today)
        #[arg(short, long)]
        applied: Option<String>,

        /// Free-form notes
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// Edit an application; omitted fields keep their value
    Edit {
        /// Application ID
        id: i64,

        #[arg(long)]
        company: Option<String>,

        #[arg(long)]
        role: Option<String>,

        #[arg(long)]
        location: Option<String>,

        #[arg(long)]
        link: Option<String>,

        #[arg(long)]
        status: Option<String>,

        #[arg(long)]
        applied: Option<String>,

        #[arg(long)]
        notes: Option<String>,
    },

    /// List applications
    List {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by company (substring)
        #[arg(short, long)]
        company: Option<String>,
    },

    /// Show application details
    Show {
        /// Application ID
        id: i64,
    },

    /// Change an application's status
    Status {
        /// Application ID
        id: i64,

        /// New status (Applied, Interview, Rejected, Offer)
        status: String,
    },

    /// Delete an application and its interview
    Delete {
        /// Application ID
        id: i64,
    },

    /// Applications waiting on a follow-up
    Reminders,

    /// Manage interviews
    Interview {
        #[command(subcommand)]
        command: InterviewCommands,
    },

    /// Manage accounts
    Account {
        #[command(subcommand)]
        command: AccountCommands,
    },

    /// Manage account profiles
    Profile {
        #[command(subcommand)]
        command: ProfileCommands,
    },

    /// Browse applications interactively
    Browse {
        /// Filter by status
        #[arg(short, long)]
        status: Option<String>,

        /// Filter by company (substring)
        #[arg(short, long)]
        company: Option<String>,
    },
}

#[derive(Subcommand)]
enum InterviewCommands {
    /// Confirm (or move) the interview of an application in Interview status
    Confirm {
        /// Application ID
        id: i64,

        /// Interview date, YYYY-MM-DD
        date: String,

        /// Interview time, HH:MM
        time: String,

        /// Venue or meeting link
        venue: String,
    },

    /// Set the status to Interview and confirm in one step
    Schedule {
        /// Application ID
        id: i64,

        /// Interview date, YYYY-MM-DD
        date: String,

        /// Interview time, HH:MM
        time: String,

        /// Venue or meeting link
        venue: String,
    },

    /// Mark an interview as done
    Complete {
        /// Application ID
        id: i64,

        /// How hard it was (Easy, Medium, Hard)
        #[arg(short, long)]
        difficulty: Option<String>,

        /// What it was like
        #[arg(short, long)]
        notes: Option<String>,
    },

    /// List upcoming and past interviews
    List,
}

#[derive(Subcommand)]
enum AccountCommands {
    /// Register an account
    Add {
        /// Display name
        name: String,

        /// Email address (unique)
        email: String,

        /// Pre-hashed credential
        #[arg(long, env = "JOBTRACK_CREDENTIAL", hide_env_values = true)]
        credential: String,
    },

    /// List accounts
    List,
}

#[derive(Subcommand)]
enum ProfileCommands {
    /// Show an account's profile
    Show {
        /// Account ID
        account_id: i64,
    },

    /// Set profile fields; omitted fields keep their value
    Edit {
        /// Account ID
        account_id: i64,

        #[arg(long)]
        name: Option<String>,

        #[arg(long)]
        age: Option<i64>,

        #[arg(long)]
        bio: Option<String>,

        #[arg(long)]
        qualifications: Option<String>,

        #[arg(long)]
        experience: Option<String>,

        #[arg(long)]
        projects: Option<String>,

        #[arg(long)]
        skills: Option<String>,

        #[arg(long)]
        achievements: Option<String>,

        #[arg(long)]
        portfolio_links: Option<String>,

        #[arg(long)]
        looking_for: Option<String>,
    },

    /// Fill a profile from a CV text file
    Import {
        /// Account ID
        account_id: i64,

        /// Path to the CV as plain text
        file: PathBuf,

        /// Extraction provider (gemini, anthropic); picked from API keys if omitted
        #[arg(short, long)]
        provider: Option<String>,
    },
}

fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn")))
        .with_writer(std::io::stderr)
        .init();

    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => match e.downcast_ref::<TrackerError>() {
            Some(err) if err.is_caller_correctable() => {
                eprintln!("error[{}]: {}", err.kind(), err);
                ExitCode::from(2)
            }
            Some(err) if err.is_fatal() => {
                eprintln!("error[{}]: {}", err.kind(), err);
                eprintln!("The database was left unchanged; no commands will run against it.");
                ExitCode::from(1)
            }
            Some(err) => {
                eprintln!("error[{}]: {:#}", err.kind(), e);
                ExitCode::from(1)
            }
            None => {
                eprintln!("error: {:#}", e);
                ExitCode::from(1)
            }
        },
    }
}

fn open(config: &Config) -> Result<Database> {
    let mut db = Database::open(&config.db_path)?;
    // A store that cannot be brought up to shape must not be used at all.
    db.migrate()?;
    Ok(db)
}

fn parse_status_filter(status: Option<String>, company: Option<String>) -> Result<ApplicationFilter> {
    Ok(ApplicationFilter {
        status: status.as_deref().map(str::parse::<Status>).transpose()?,
        company,
    })
}

fn run(cli: Cli) -> Result<()> {
    let config = cli.config.resolve()?;

    match cli.command {
        Commands::Init => {
            let mut db = Database::open(&config.db_path)?;
            let summary = db.migrate()?;
            println!("Database ready at {}", db.path().display());
            for table in &summary.schema.created_tables {
                println!("  created table {}", table);
            }
            for column in &summary.schema.added_columns {
                println!("  added column {}", column);
            }
            for table in &summary.schema.rebuilt_tables {
                println!("  rebuilt table {}", table);
            }
            for index in &summary.schema.created_indexes {
                println!("  created index {}", index);
            }
            if summary.promotion.promoted > 0 || summary.promotion.backfilled > 0 {
                println!(
                    "  promoted {} legacy interview(s), back-filled {} tag(s)",
                    summary.promotion.promoted, summary.promotion.backfilled
                );
            }
            if summary.promotion.skipped > 0 {
                println!(
                    "  {} legacy interview(s) left inline (unreadable date or time)",
                    summary.promotion.skipped
                );
            }
        }

        Commands::Add {
            company,
            role,
            location,
            link,
            status,
            applied,
            notes,
        } => {
            let mut db = open(&config)?;
            let input = ApplicationInput {
                company,
                role,
                location,
                job_link: link,
                status,
                applied_date: applied.unwrap_or_else(|| config.today.format("%Y-%m-%d").to_string()),
                notes,
            };
            let app = db.create_application(&input, config.today)?;
            println!("Added application #{} ({} at {})", app.id, app.role, app.company);
        }

        Commands::Edit {
            id,
            company,
            role,
            location,
            link,
            status,
            applied,
            notes,
        } => {
            let mut db = open(&config)?;
            let current = db.get_application(id)?;
            let input = ApplicationInput {
                company: company.unwrap_or(current.company),
                role: role.unwrap_or(current.role),
                location: location.unwrap_or(current.location),
                job_link: link.unwrap_or(current.job_link),
                status: status.unwrap_or_else(|| current.status.to_string()),
                applied_date: applied.unwrap_or_else(|| current.applied_date.format("%Y-%m-%d").to_string()),
                notes: notes.or(current.notes),
            };
            let app = db.update_application(id, &input)?;
            println!("Updated application #{}", app.id);
        }

        Commands::List { status, company } => {
            let db = open(&config)?;
            let filter = parse_status_filter(status, company)?;
            let items = db.list_applications(&filter, config.today)?;
            if items.is_empty() {
                println!("No applications found.");
            } else {
                println!(
                    "{:<6} {:<10} {:<24} {:<24} {:<11} {:<10}",
                    "ID", "STATUS", "COMPANY", "ROLE", "APPLIED", "FLAGS"
                );
                println!("{}", "-".repeat(88));
                for item in items {
                    let app = &item.application;
                    let mut flags = Vec::new();
                    if item.needs_follow_up {
                        flags.push("follow-up");
                    }
                    if item.awaiting_interview_details {
                        flags.push("confirm");
                    }
                    println!(
                        "{:<6} {:<10} {:<24} {:<24} {:<11} {:<10}",
                        app.id,
                        app.status,
                        truncate(&app.company, 22),
                        truncate(&app.role, 22),
                        app.applied_date,
                        flags.join(",")
                    );
                }
            }
        }

        Commands::Show { id } => {
            let db = open(&config)?;
            let app = db.get_application(id)?;
            println!("Application #{}", app.id);
            println!("Company: {}", app.company);
            println!("Role: {}", app.role);
            println!("Location: {}", app.location);
            println!("Status: {}", app.status);
            println!(
                "Applied: {} ({} days ago)",
                app.applied_date,
                lifecycle::days_since_applied(&app, config.today)
            );
            println!("Link: {}", app.job_link);
            if lifecycle::needs_follow_up(&app, config.today) {
                println!("Follow up: no reply for {}+ days", lifecycle::FOLLOW_UP_AFTER_DAYS);
            }
            if let Some(notes) = &app.notes {
                println!("\n--- Notes ---\n{}", textwrap::fill(notes, 80));
            }

            match db.get_interview(id)? {
                Some(interview) => {
                    let timing = lifecycle::classify_interview(interview.date, config.today, config.soon_days);
                    println!("\n--- Interview ---");
                    match interview.time {
                        Some(time) => println!("When: {} {} ({})", interview.date, time.format("%H:%M"), timing.label()),
                        None => println!("When: {} ({})", interview.date, timing.label()),
                    }
                    println!("Venue: {}", interview.venue);
                    if interview.completed {
                        let difficulty = interview.difficulty.map(|d| d.as_str()).unwrap_or("-");
                        println!("Completed (difficulty: {})", difficulty);
                    } else if let Some(link) = calendar::interview_link(&interview) {
                        println!("Add to calendar: {}", link);
                    }
                    if let Some(notes) = &interview.notes {
                        println!("Experience: {}", notes);
                    }
                }
                None if app.status == Status::Interview => {
                    println!("\nInterview not confirmed yet. Run: jobtrack interview confirm {} <date> <time> <venue>", id);
                }
                None => {}
            }
        }

        Commands::Status { id, status } => {
            let mut db = open(&config)?;
            let app = db.set_status(id, &status)?;
            println!("Application #{} is now {}", app.id, app.status);
            if app.status == Status::Interview && db.find_interview_record(id)?.is_none() {
                println!("Confirm the interview with: jobtrack interview confirm {} <date> <time> <venue>", id);
            }
        }

        Commands::Delete { id } => {
            let mut db = open(&config)?;
            db.delete_application(id)?;
            println!("Deleted application #{}", id);
        }

        Commands::Reminders => {
            let db = open(&config)?;
            let due = db.follow_up_reminders(config.today)?;
            if due.is_empty() {
                println!("Nothing to follow up on.");
            } else {
                println!("{:<6} {:<24} {:<24} {:>6}", "ID", "COMPANY", "ROLE", "DAYS");
                println!("{}", "-".repeat(63));
                for (app, days) in due {
                    println!(
                        "{:<6} {:<24} {:<24} {:>6}",
                        app.id,
                        truncate(&app.company, 22),
                        truncate(&app.role, 22),
                        days
                    );
                }
            }
        }

        Commands::Interview { command } => {
            let mut db = open(&config)?;
            match command {
                InterviewCommands::Confirm { id, date, time, venue } => {
                    let slot = InterviewSlot::parse(&date, &time, &venue)?;
                    let record = db.confirm_interview(id, &slot)?;
                    println!(
                        "Interview for #{} on {} at {} ({})",
                        id,
                        record.interview_date,
                        record.interview_time.format("%H:%M"),
                        record.venue
                    );
                }

                InterviewCommands::Schedule { id, date, time, venue } => {
                    let slot = InterviewSlot::parse(&date, &time, &venue)?;
                    let record = db.schedule_interview(id, &slot)?;
                    println!(
                        "#{} moved to Interview; scheduled {} at {} ({})",
                        id,
                        record.interview_date,
                        record.interview_time.format("%H:%M"),
                        record.venue
                    );
                }

                InterviewCommands::Complete { id, difficulty, notes } => {
                    let difficulty = difficulty.as_deref().map(str::parse::<Difficulty>).transpose()?;
                    db.complete_interview(id, difficulty, notes.as_deref())?;
                    println!("Interview for #{} marked completed", id);
                }

                InterviewCommands::List => {
                    let board = db.list_interviews(config.today, config.soon_days)?;
                    if board.upcoming.is_empty() && board.past.is_empty() {
                        println!("No interviews.");
                    }
                    if !board.upcoming.is_empty() {
                        println!("UPCOMING");
                        print_interviews(&board.upcoming);
                        for entry in &board.upcoming {
                            if let Some(link) = calendar::interview_link(&entry.interview) {
                                println!("  #{} calendar: {}", entry.interview.application_id, link);
                            }
                        }
                    }
                    if !board.past.is_empty() {
                        if !board.upcoming.is_empty() {
                            println!();
                        }
                        println!("PAST");
                        print_interviews(&board.past);
                    }
                }
            }
        }

        Commands::Account { command } => {
            let mut db = open(&config)?;
            match command {
                AccountCommands::Add { name, email, credential } => {
                    let account = db.create_account(&name, &email, &credential)?;
                    println!("Added account #{} ({})", account.id, account.email);
                }

                AccountCommands::List => {
                    let accounts = db.list_accounts()?;
                    if accounts.is_empty() {
                        println!("No accounts found.");
                    } else {
                        println!("{:<6} {:<24} {:<30} {:<20}", "ID", "NAME", "EMAIL", "CREATED");
                        println!("{}", "-".repeat(82));
                        for account in accounts {
                            println!(
                                "{:<6} {:<24} {:<30} {:<20}",
                                account.id,
                                truncate(&account.name, 22),
                                truncate(&account.email, 28),
                                account.created_at
                            );
                        }
                    }
                }
            }
        }

        Commands::Profile { command } => {
            let mut db = open(&config)?;
            match command {
                ProfileCommands::Show { account_id } => {
                    let account = db.get_account(account_id)?;
                    match db.get_profile(account_id)? {
                        Some(profile) => print_profile(&account.name, &profile.fields),
                        None => println!("No profile yet for {} (account #{}).", account.name, account_id),
                    }
                }

                ProfileCommands::Edit {
                    account_id,
                    name,
                    age,
                    bio,
                    qualifications,
                    experience,
                    projects,
                    skills,
                    achievements,
                    portfolio_links,
                    looking_for,
                } => {
                    let mut fields = db
                        .get_profile(account_id)?
                        .map(|p| p.fields)
                        .unwrap_or_default();
                    fields.merge_from(&ProfileFields {
                        name,
                        age,
                        bio,
                        qualifications,
                        experience,
                        projects,
                        skills,
                        achievements,
                        portfolio_links,
                        looking_for,
                    });
                    db.save_profile(account_id, &fields)?;
                    println!("Saved profile for account #{}", account_id);
                }

                ProfileCommands::Import {
                    account_id,
                    file,
                    provider,
                } => {
                    let text = std::fs::read_to_string(&file)
                        .with_context(|| format!("Failed to read CV file: {}", file.display()))?;

                    let provider = match extract::resolve_provider(provider.as_deref()) {
                        Ok(p) => Some(p),
                        Err(e) => {
                            tracing::warn!("{:#}", e);
                            None
                        }
                    };

                    let outcome = db.import_profile(account_id, &text, provider.as_deref())?;
                    if outcome.extracted {
                        let account = db.get_account(account_id)?;
                        println!("Imported profile for account #{}", account_id);
                        println!();
                        print_profile(&account.name, &outcome.profile.fields);
                    } else {
                        println!(
                            "Nothing extracted; profile for account #{} left as it was",
                            account_id
                        );
                    }
                }
            }
        }

        Commands::Browse { status, company } => {
            let mut db = open(&config)?;
            let filter = parse_status_filter(status, company)?;
            tui::run_browse(&mut db, &filter, config.today, config.soon_days)?;
        }
    }

    Ok(())
}

fn print_interviews(entries: &[InterviewEntry]) {
    println!(
        "{:<6} {:<20} {:<20} {:<11} {:<6} {:<18} {:<10}",
        "ID", "COMPANY", "ROLE", "DATE", "TIME", "VENUE", "WHEN"
    );
    println!("{}", "-".repeat(95));
    for entry in entries {
        let interview = &entry.interview;
        let when = if entry.missed {
            "missed"
        } else if interview.completed {
            "done"
        } else {
            entry.timing.label()
        };
        let time = interview
            .time
            .map(|t| t.format("%H:%M").to_string())
            .unwrap_or_else(|| "-".to_string());
        println!(
            "{:<6} {:<20} {:<20} {:<11} {:<6} {:<18} {:<10}",
            interview.application_id,
            truncate(&interview.company, 18),
            truncate(&interview.role, 18),
            interview.date,
            time,
            truncate(&interview.venue, 16),
            when
        );
    }
}

fn print_profile(account_name: &str, fields: &ProfileFields) {
    println!("Profile of {}", account_name);
    let rows = [
        ("Name", fields.name.clone()),
        ("Age", fields.age.map(|a| a.to_string())),
        ("Bio", fields.bio.clone()),
        ("Qualifications", fields.qualifications.clone()),
        ("Experience", fields.experience.clone()),
        ("Projects", fields.projects.clone()),
        ("Skills", fields.skills.clone()),
        ("Achievements", fields.achievements.clone()),
        ("Portfolio", fields.portfolio_links.clone()),
        ("Looking for", fields.looking_for.clone()),
    ];
    for (label, value) in rows {
        if let Some(value) = value {
            let wrapped = textwrap::fill(&value, 64);
            let mut lines = wrapped.lines();
            println!("{:<16}{}", format!("{}:", label), lines.next().unwrap_or_default());
            for line in lines {
                println!("{:<16}{}", "", line);
            }
        }
    }
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}
