use std::{
    collections::{BTreeSet, HashSet},
    fs,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use log::{debug, info, warn};
use notecal::agenda::{self, AgendaRange, AgendaSource};
use notecal::core::{DailyNote, EventNote, Tag};
use notecal::storage::{FsNoteLoader, NoteLoader};
use notecal::{
    CategoryRegistry, NotecalConfig, ParseOptions, format_daily_source, format_event_note,
    parse_event_note_with, validate_record,
};

#[derive(Debug, Parser)]
#[command(
    name = "notecal",
    about = "Calendar data from markdown event and daily notes",
    version
)]
struct Cli {
    /// Enable debug logging (RUST_LOG overrides).
    #[arg(long, global = true)]
    verbose: bool,
    /// JSON config with tag syntax and category colors.
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Parse event notes and print them.
    Event(ParseArgs),

    /// Parse daily notes and print them.
    Daily(ParseArgs),

    /// Check event form records stored as JSON.
    Validate(ValidateArgs),

    /// Merge event and daily notes into a dated agenda.
    Agenda(AgendaArgs),

    /// Rewrite notes in canonical form.
    Format(FormatArgs),

    /// List tags with their category colors.
    Tags(TagsArgs),
}

#[derive(Debug, Args)]
struct ParseArgs {
    /// Markdown files or directories containing markdown files.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Emit JSON instead of a debug representation.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct ValidateArgs {
    /// JSON files holding one record or an array of records.
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

#[derive(Debug, Args)]
struct AgendaArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Inclusive start date filter (YYYY-MM-DD).
    #[arg(long)]
    from: Option<NaiveDate>,
    /// Inclusive end date filter (YYYY-MM-DD).
    #[arg(long)]
    to: Option<NaiveDate>,
    /// Emit JSON instead of a human-readable list.
    #[arg(long)]
    json: bool,
}

#[derive(Debug, Args)]
struct FormatArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
    /// Overwrite the file instead of printing to stdout.
    #[arg(long)]
    in_place: bool,
}

#[derive(Debug, Args)]
struct TagsArgs {
    #[arg(required = true)]
    inputs: Vec<PathBuf>,
}

/// Everything a handler needs that comes from global flags.
struct App {
    loader: FsNoteLoader,
    registry: CategoryRegistry,
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    let config = match &cli.config {
        Some(path) => NotecalConfig::load(path)?,
        None => NotecalConfig::default(),
    };
    let app = App {
        loader: FsNoteLoader::new(config.parse.clone()),
        registry: config.registry(),
    };
    debug!("{} categories registered", app.registry.len());

    match cli.command {
        Commands::Event(args) => handle_event(args, &app),
        Commands::Daily(args) => handle_daily(args, &app),
        Commands::Validate(args) => handle_validate(args),
        Commands::Agenda(args) => handle_agenda(args, &app),
        Commands::Format(args) => handle_format(args, &app),
        Commands::Tags(args) => handle_tags(args, &app),
    }
}

fn init_logging(verbose: bool) {
    let default_level = if verbose { "debug" } else { "warn" };
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or(default_level))
        .target(env_logger::Target::Stderr)
        .init();
}

fn handle_event(args: ParseArgs, app: &App) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let mut parsed = Vec::new();
    for path in expand_note_inputs(&inputs)? {
        match app.loader.load_event(&path)? {
            Some(note) => parsed.push((path, note)),
            None => warn!("{:?} is not an event note; skipping", path),
        }
    }
    print_parsed(&parsed, json)
}

fn handle_daily(args: ParseArgs, app: &App) -> Result<()> {
    let ParseArgs { inputs, json } = args;
    let mut parsed = Vec::new();
    for path in expand_note_inputs(&inputs)? {
        match app.loader.load_daily(&path)? {
            Some(note) => parsed.push((path, note)),
            None => warn!("{:?} is not a daily note; skipping", path),
        }
    }
    print_parsed(&parsed, json)
}

fn print_parsed<T>(parsed: &[(PathBuf, T)], json: bool) -> Result<()>
where
    T: serde::Serialize + std::fmt::Debug,
{
    if json {
        #[derive(serde::Serialize)]
        struct JsonOutput<'a, T> {
            path: String,
            note: &'a T,
        }

        let payload: Vec<JsonOutput<'_, T>> = parsed
            .iter()
            .map(|(path, note)| JsonOutput {
                path: path.display().to_string(),
                note,
            })
            .collect();
        println!("{}", serde_json::to_string_pretty(&payload)?);
    } else {
        for (idx, (path, note)) in parsed.iter().enumerate() {
            if let Some(header) = section_header(path, idx, parsed.len()) {
                println!("{header}");
            }
            println!("{:#?}", note);
        }
    }
    Ok(())
}

fn handle_validate(args: ValidateArgs) -> Result<()> {
    let mut failures = 0usize;
    let mut total = 0usize;
    for path in &args.inputs {
        let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
        let value: serde_json::Value =
            serde_json::from_str(&text).with_context(|| format!("parsing JSON in {:?}", path))?;
        let records = match value {
            serde_json::Value::Array(items) => items,
            other => vec![other],
        };
        for (idx, record) in records.iter().enumerate() {
            total += 1;
            match validate_record(record) {
                Ok(form) => println!("{}#{idx}: ok ({} {})", path.display(), form.start, form.title),
                Err(errors) => {
                    failures += 1;
                    for issue in errors.issues() {
                        println!("{}#{idx}: {issue}", path.display());
                    }
                }
            }
        }
    }
    info!("validated {total} records, {failures} failed");
    if failures > 0 {
        anyhow::bail!("{failures} of {total} records failed validation");
    }
    Ok(())
}

fn handle_agenda(args: AgendaArgs, app: &App) -> Result<()> {
    let AgendaArgs {
        inputs,
        from,
        to,
        json,
    } = args;
    let (events, dailies) = load_notes(&inputs, &app.loader)?;
    let items = agenda::project(&events, &dailies, &AgendaRange::new(from, to));

    if items.is_empty() {
        eprintln!("No agenda items found for the provided inputs.");
        return Ok(());
    }

    if json {
        println!("{}", serde_json::to_string_pretty(&items)?);
    } else {
        for item in items {
            let time = match (item.time, item.all_day) {
                (Some(time), _) => time.to_string(),
                (None, true) => "all-day".to_string(),
                (None, false) => "--:--".to_string(),
            };
            let source = match item.source {
                AgendaSource::Event => "EVENT",
                AgendaSource::Daily => "DAILY",
            };
            println!(
                "{} {:<11} {:<5} {}{}",
                item.date,
                time,
                source,
                item.title,
                render_tags(&item.tags)
            );
        }
    }
    Ok(())
}

fn handle_format(args: FormatArgs, app: &App) -> Result<()> {
    let FormatArgs { inputs, in_place } = args;
    let expanded = expand_note_inputs(&inputs)?;

    for (idx, path) in expanded.iter().enumerate() {
        let Some(formatted) = format_file(path, &app.loader.options)? else {
            warn!("{:?} holds no calendar data; leaving it untouched", path);
            continue;
        };

        if in_place {
            info!("formatting {:?}", path);
            fs::write(path, formatted.as_bytes())
                .with_context(|| format!("writing {:?}", path))?;
        } else {
            if let Some(header) = section_header(path, idx, expanded.len()) {
                println!("{header}");
            }
            print!("{formatted}");
        }
    }
    Ok(())
}

/// Canonical text for one note. Daily notes keep every non-entry line.
fn format_file(path: &Path, options: &ParseOptions) -> Result<Option<String>> {
    let text = fs::read_to_string(path).with_context(|| format!("reading {:?}", path))?;
    if let Some(note) = parse_event_note_with(&text, options) {
        return Ok(Some(format_event_note(&note)));
    }
    Ok(format_daily_source(&text, options))
}

/// `== path ==` separator, only when more than one file is printed.
fn section_header(path: &Path, idx: usize, total: usize) -> Option<String> {
    match (total, idx) {
        (0 | 1, _) => None,
        (_, 0) => Some(format!("== {} ==", path.display())),
        _ => Some(format!("\n== {} ==", path.display())),
    }
}

fn handle_tags(args: TagsArgs, app: &App) -> Result<()> {
    let (events, dailies) = load_notes(&args.inputs, &app.loader)?;
    let tags: BTreeSet<Tag> = events
        .iter()
        .flat_map(|note| note.tags.iter().cloned())
        .chain(dailies.iter().flat_map(DailyNote::tags))
        .collect();

    for tag in tags {
        let color = app.registry.get_or(tag.as_str(), "-");
        println!("{:<20} {}", tag, color);
    }
    Ok(())
}

/// Loads each input as an event note, falling back to a daily note.
fn load_notes(
    inputs: &[PathBuf],
    loader: &dyn NoteLoader,
) -> Result<(Vec<EventNote>, Vec<DailyNote>)> {
    let mut events = Vec::new();
    let mut dailies = Vec::new();
    for path in expand_note_inputs(inputs)? {
        if let Some(note) = loader.load_event(&path)? {
            debug!("{:?} is an event note", path);
            events.push(note);
        } else if let Some(note) = loader.load_daily(&path)? {
            debug!("{:?} is a daily note", path);
            dailies.push(note);
        } else {
            warn!("{:?} holds no calendar data; skipping", path);
        }
    }
    Ok((events, dailies))
}

fn render_tags(tags: &BTreeSet<Tag>) -> String {
    tags.iter().map(|tag| format!(" #{tag}")).collect()
}

fn expand_note_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let expanded = expand_inputs(paths)?;
    if expanded.is_empty() {
        anyhow::bail!("no markdown files found in the provided inputs");
    }
    Ok(expanded)
}

fn is_markdown(path: &Path) -> bool {
    path.extension()
        .and_then(|ext| ext.to_str())
        .is_some_and(|ext| ext.eq_ignore_ascii_case("md") || ext.eq_ignore_ascii_case("markdown"))
}

fn expand_inputs(paths: &[PathBuf]) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = BTreeSet::new();
    for path in paths {
        let canonical =
            fs::canonicalize(path).with_context(|| format!("resolving path {:?}", path))?;
        let meta = fs::metadata(&canonical)
            .with_context(|| format!("reading metadata for {:?}", canonical))?;
        if meta.is_dir() {
            debug!("scanning directory {:?}", canonical);
            for file in collect_markdown_files(&canonical)? {
                if visited.insert(file.clone()) {
                    out.push(file);
                }
            }
        } else if meta.is_file() {
            if !is_markdown(&canonical) {
                anyhow::bail!("{:?} is not a markdown file", canonical);
            }
            if visited.insert(canonical.clone()) {
                out.push(canonical);
            }
        }
    }
    Ok(out)
}

fn collect_markdown_files(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut out = Vec::new();
    let mut visited = HashSet::new();
    visit_dir(dir, &mut out, &mut visited)?;
    out.sort();
    out.dedup();
    Ok(out)
}

fn visit_dir(path: &Path, out: &mut Vec<PathBuf>, visited: &mut HashSet<PathBuf>) -> Result<()> {
    let canonical = fs::canonicalize(path)?;
    if !visited.insert(canonical.clone()) {
        return Ok(());
    }

    let metadata = fs::metadata(&canonical)?;
    if metadata.is_dir() {
        for entry in fs::read_dir(&canonical)? {
            let entry = entry?;
            if entry.file_type()?.is_symlink() {
                continue;
            }
            visit_dir(&entry.path(), out, visited)?;
        }
    } else if metadata.is_file() && is_markdown(&canonical) {
        debug!("found note {:?}", canonical);
        out.push(canonical);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn expand_inputs_walks_directories_for_markdown() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let root = tmp.path();
        let nested = root.join("2025").join("01");
        fs::create_dir_all(&nested).expect("mkdir nested");
        fs::write(root.join("trip.md"), "---\nstart: 2025-01-14\n---\n# Trip\n").expect("write");
        fs::write(nested.join("2025-01-15.markdown"), "# 2025-01-15\n").expect("write");
        fs::write(root.join("notes.txt"), "ignored").expect("write");

        let files = expand_inputs(&[root.to_path_buf()]).expect("expand");
        let names: Vec<_> = files
            .iter()
            .filter_map(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .collect();
        assert_eq!(names.len(), 2);
        assert!(names.contains(&"trip.md".to_string()));
        assert!(names.contains(&"2025-01-15.markdown".to_string()));
    }

    #[test]
    fn expand_inputs_dedups_repeated_paths() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("a.md");
        fs::write(&file, "# 2025-01-15\n").expect("write");

        let files = expand_inputs(&[file.clone(), tmp.path().to_path_buf()]).expect("expand");
        assert_eq!(files, [fs::canonicalize(&file).expect("canonical")]);
    }

    #[test]
    fn explicit_non_markdown_file_is_rejected() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let file = tmp.path().join("data.json");
        fs::write(&file, "{}").expect("write");
        assert!(expand_inputs(&[file]).is_err());
    }

    #[test]
    fn in_place_format_keeps_daily_prose() {
        let tmp = tempfile::tempdir().expect("tempdir");
        let path = tmp.path().join("2025-01-15.md");
        fs::write(
            &path,
            "# 2025-01-15\nMorning thoughts about the plan.\n## Afternoon\n-   [14:00]  Review #work\n",
        )
        .expect("write");

        let app = App {
            loader: FsNoteLoader::default(),
            registry: CategoryRegistry::new(),
        };
        let args = FormatArgs {
            inputs: vec![path.clone()],
            in_place: true,
        };
        handle_format(args, &app).expect("format");

        let text = fs::read_to_string(&path).expect("read back");
        assert_eq!(
            text,
            "# 2025-01-15\nMorning thoughts about the plan.\n## Afternoon\n- [14:00] Review #work\n"
        );
    }

    #[test]
    fn headers_depend_on_expanded_file_count() {
        let path = Path::new("notes/a.md");
        assert_eq!(section_header(path, 0, 1), None);
        assert_eq!(section_header(path, 0, 3).as_deref(), Some("== notes/a.md =="));
        assert_eq!(section_header(path, 2, 3).as_deref(), Some("\n== notes/a.md =="));
    }

    #[test]
    fn load_notes_sorts_inputs_by_kind() {
        let tmp = tempfile::tempdir().expect("tempdir");
        fs::write(
            tmp.path().join("launch.md"),
            "---\nstart: 2025-01-15\ntags: [work]\n---\n# Launch\n",
        )
        .expect("write");
        fs::write(tmp.path().join("day.md"), "# 2025-01-15\n- [09:00] Standup #team\n")
            .expect("write");
        fs::write(tmp.path().join("readme.md"), "Just some notes.\n").expect("write");

        let loader = FsNoteLoader::default();
        let (events, dailies) =
            load_notes(&[tmp.path().to_path_buf()], &loader).expect("load notes");
        assert_eq!(events.len(), 1);
        assert_eq!(dailies.len(), 1);
        assert_eq!(render_tags(&events[0].tags), " #work");
    }
}
