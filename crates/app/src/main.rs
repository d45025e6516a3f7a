use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use course_core::model::{ChapterDraft, CourseId, SectionDraft, SectionKind, StudentId};
use services::{AppServices, ChapterService, Clock, UnconfiguredQuizGenerator};
use tracing_subscriber::EnvFilter;

mod config;

use config::Config;

#[derive(Debug)]
enum ArgsError {
    MissingValue { flag: &'static str },
    MissingFlag { flag: &'static str },
    UnknownArg(String),
    InvalidId { flag: &'static str, raw: String },
    InvalidDbUrl { raw: String },
}

impl fmt::Display for ArgsError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ArgsError::MissingValue { flag } => write!(f, "{flag} requires a value"),
            ArgsError::MissingFlag { flag } => write!(f, "{flag} is required"),
            ArgsError::UnknownArg(arg) => write!(f, "unknown argument: {arg}"),
            ArgsError::InvalidId { flag, raw } => write!(f, "invalid {flag} value: {raw}"),
            ArgsError::InvalidDbUrl { raw } => write!(f, "invalid --db value: {raw}"),
        }
    }
}

impl std::error::Error for ArgsError {}

fn require_value(
    args: &mut impl Iterator<Item = String>,
    flag: &'static str,
) -> Result<String, ArgsError> {
    args.next().ok_or(ArgsError::MissingValue { flag })
}

fn parse_id<T: FromStr>(flag: &'static str, raw: String) -> Result<T, ArgsError> {
    raw.parse().map_err(|_| ArgsError::InvalidId { flag, raw })
}

fn print_usage() {
    eprintln!("Usage:");
    eprintln!("  cargo run -p app -- migrate  [--db <sqlite_url>]");
    eprintln!("  cargo run -p app -- seed     [--db <sqlite_url>] [--course <id>]");
    eprintln!("  cargo run -p app -- chapters [--db <sqlite_url>] --course <id>");
    eprintln!("  cargo run -p app -- stats    [--db <sqlite_url>] --course <id>");
    eprintln!("  cargo run -p app -- progress [--db <sqlite_url>] --course <id> --student <id>");
    eprintln!();
    eprintln!("Defaults:");
    eprintln!("  --db {}", config::DEFAULT_DB_URL);
    eprintln!("  --course 1 (seed only)");
    eprintln!();
    eprintln!("Environment:");
    eprintln!("  COURSE_DB_URL, RUST_LOG");
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Command {
    Migrate,
    Seed,
    Chapters,
    Stats,
    Progress,
}

impl Command {
    fn from_arg(arg: &str) -> Option<Self> {
        match arg {
            "migrate" => Some(Self::Migrate),
            "seed" => Some(Self::Seed),
            "chapters" => Some(Self::Chapters),
            "stats" => Some(Self::Stats),
            "progress" => Some(Self::Progress),
            _ => None,
        }
    }
}

struct Args {
    db_url: String,
    course_id: Option<CourseId>,
    student_id: Option<StudentId>,
}

impl Args {
    fn parse(
        args: &mut impl Iterator<Item = String>,
        default_db_url: &str,
    ) -> Result<Self, ArgsError> {
        let mut db_url = normalize_sqlite_url(default_db_url.to_owned());
        let mut course_id = None;
        let mut student_id = None;

        while let Some(arg) = args.next() {
            match arg.as_str() {
                "--db" => {
                    let value = require_value(args, "--db")?;
                    if value.trim().is_empty() {
                        return Err(ArgsError::InvalidDbUrl { raw: value });
                    }
                    db_url = normalize_sqlite_url(value);
                }
                "--course" => {
                    let value = require_value(args, "--course")?;
                    course_id = Some(parse_id("--course", value)?);
                }
                "--student" => {
                    let value = require_value(args, "--student")?;
                    student_id = Some(parse_id("--student", value)?);
                }
                "--help" | "-h" => {
                    print_usage();
                    std::process::exit(0);
                }
                _ => return Err(ArgsError::UnknownArg(arg)),
            }
        }

        Ok(Self {
            db_url,
            course_id,
            student_id,
        })
    }

    fn course(&self) -> Result<CourseId, ArgsError> {
        self.course_id
            .ok_or(ArgsError::MissingFlag { flag: "--course" })
    }

    fn student(&self) -> Result<StudentId, ArgsError> {
        self.student_id
            .ok_or(ArgsError::MissingFlag { flag: "--student" })
    }
}

fn normalize_sqlite_url(raw: String) -> String {
    let trimmed = raw.trim();
    if trimmed == "sqlite::memory:" || trimmed.starts_with("sqlite://") {
        return trimmed.to_owned();
    }

    let path_str = trimmed.strip_prefix("sqlite:").unwrap_or(trimmed);
    let path = std::path::Path::new(path_str);
    let absolute = if path.is_absolute() {
        path.to_path_buf()
    } else {
        std::env::current_dir()
            .unwrap_or_else(|_| std::path::PathBuf::from("."))
            .join(path)
    };
    format!("sqlite://{}", absolute.display())
}

fn init_tracing(filter: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::new(filter))
        .with_writer(std::io::stderr)
        .init();
}

fn print_json(value: &impl serde::Serialize) -> Result<(), Box<dyn std::error::Error>> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

async fn run() -> Result<(), Box<dyn std::error::Error>> {
    let config = Config::from_env()?;
    init_tracing(&config.log_filter);

    let mut argv = std::env::args().skip(1);
    let cmd = match argv.next() {
        None => {
            print_usage();
            return Ok(());
        }
        Some(first) if first == "--help" || first == "-h" => {
            print_usage();
            return Ok(());
        }
        Some(first) => Command::from_arg(&first).ok_or_else(|| {
            eprintln!("unknown subcommand: {first}");
            print_usage();
            ArgsError::UnknownArg(first.clone())
        })?,
    };

    let parsed = Args::parse(&mut argv, &config.database_url).map_err(|e| {
        eprintln!("{e}");
        print_usage();
        e
    })?;

    // Open + migrate SQLite here so core and services stay storage-agnostic.
    prepare_sqlite_file(&parsed.db_url)?;
    let app = AppServices::new_sqlite(
        &parsed.db_url,
        Clock::default_clock(),
        Arc::new(UnconfiguredQuizGenerator),
    )
    .await?;

    match cmd {
        Command::Migrate => {
            tracing::info!(db = %parsed.db_url, "database is up to date");
        }
        Command::Seed => {
            let course_id = parsed.course_id.unwrap_or_else(|| CourseId::new(1));
            seed_course(&app.chapters(), course_id).await?;
        }
        Command::Chapters => {
            let outline = app.chapters().progressive_order(parsed.course()?).await?;
            print_json(&outline)?;
        }
        Command::Stats => {
            let stats = app.stats().course_stats(parsed.course()?).await?;
            print_json(&stats)?;
        }
        Command::Progress => {
            let view = app
                .progress()
                .course_progress(parsed.student()?, parsed.course()?)
                .await?;
            print_json(&view)?;
        }
    }
    Ok(())
}

/// Create a small published course unless it already has chapters.
async fn seed_course(
    chapters: &ChapterService,
    course_id: CourseId,
) -> Result<(), Box<dyn std::error::Error>> {
    if !chapters.list_chapters(course_id).await?.is_empty() {
        tracing::info!(%course_id, "course already has chapters, skipping seed");
        return Ok(());
    }

    let mut diagram = SectionDraft::text("ownership-diagram", false, 2).with_title("Move diagram");
    diagram.kind = SectionKind::Image;

    let first = chapters
        .create_chapter(
            ChapterDraft::new(course_id, 1, "Ownership")
                .with_sections(vec![
                    SectionDraft::text("moves", true, 10)
                        .with_title("Moves")
                        .with_content("Assigning a value moves ownership to the new binding."),
                    SectionDraft::text("borrows", true, 12)
                        .with_title("Borrows")
                        .with_content("References borrow a value without taking ownership."),
                    diagram,
                ])
                .published(),
        )
        .await?;

    let second = chapters
        .create_chapter(
            ChapterDraft::new(course_id, 2, "Lifetimes")
                .with_sections(vec![
                    SectionDraft::text("annotations", true, 15)
                        .with_title("Annotations")
                        .with_content("Lifetime parameters relate the validity of references."),
                ])
                .with_prerequisites(vec![first.id()])
                .published(),
        )
        .await?;

    chapters
        .create_chapter(
            ChapterDraft::new(course_id, 3, "Traits")
                .with_sections(vec![
                    SectionDraft::text("bounds", true, 20)
                        .with_title("Trait bounds")
                        .with_content("Bounds constrain generic parameters to types with behaviour."),
                ])
                .with_prerequisites(vec![second.id()]),
        )
        .await?;

    tracing::info!(%course_id, "seeded course with 3 chapters");
    Ok(())
}

fn prepare_sqlite_file(db_url: &str) -> Result<(), Box<dyn std::error::Error>> {
    if db_url == "sqlite::memory:" {
        return Ok(());
    }

    let path = db_url
        .strip_prefix("sqlite://")
        .ok_or_else(|| ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        })?;
    let path = path.split('?').next().unwrap_or(path);
    if path.is_empty() {
        return Err(ArgsError::InvalidDbUrl {
            raw: db_url.to_string(),
        }
        .into());
    }

    let path = std::path::Path::new(path);
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }

    if !path.exists() {
        std::fs::OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(false)
            .open(path)?;
    }

    Ok(())
}

#[tokio::main]
async fn main() {
    if let Err(err) = run().await {
        // Binary glue: print once and exit.
        eprintln!("{err}");
        std::process::exit(2);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse(args: &[&str]) -> Result<Args, ArgsError> {
        let mut iter = args.iter().map(|s| (*s).to_owned());
        Args::parse(&mut iter, "sqlite://dev.sqlite3")
    }

    #[test]
    fn flags_override_defaults() {
        let args = parse(&["--db", "sqlite:///tmp/course.db", "--course", "7", "--student", "3"])
            .unwrap();
        assert_eq!(args.db_url, "sqlite:///tmp/course.db");
        assert_eq!(args.course().unwrap(), CourseId::new(7));
        assert_eq!(args.student().unwrap(), StudentId::new(3));
    }

    #[test]
    fn bad_ids_and_missing_flags_are_reported() {
        assert!(matches!(
            parse(&["--course", "abc"]),
            Err(ArgsError::InvalidId { flag: "--course", .. })
        ));
        assert!(matches!(
            parse(&["--student"]),
            Err(ArgsError::MissingValue { flag: "--student" })
        ));
        assert!(matches!(
            parse(&[]).unwrap().course(),
            Err(ArgsError::MissingFlag { flag: "--course" })
        ));
    }

    #[test]
    fn relative_paths_become_absolute_urls() {
        let url = normalize_sqlite_url("sqlite:data/course.db".to_owned());
        assert!(url.starts_with("sqlite:///"));
        assert!(url.ends_with("data/course.db"));
    }
}
