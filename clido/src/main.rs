use std::{
    env,
    io::{self, BufRead, IsTerminal, Write},
    path::PathBuf,
    process::ExitCode,
};

use anyhow::{Context as _, Result};
use chrono::NaiveDate;
use clap::{Args, Parser, Subcommand};
use clido::api::ApiClient;
use clido::config::{self, ConfigDir, Context};
use clido::core::{DirectorySettings, Login, NewProject, NewTodo};
use clido::edit::{EditOutcome, EditSession, Editor, InheritedTerminal};
use clido::render;
use crossterm::event::{self, Event, KeyCode, KeyEvent, KeyEventKind, KeyModifiers};
use crossterm::terminal;
use tracing::debug;
use tracing_subscriber::EnvFilter;

#[derive(Debug, Parser)]
#[command(
    name = "cli-do",
    about = "Command-line client for the cli-do todo service",
    version
)]
struct Cli {
    /// Enable verbose logging for debugging.
    #[arg(long, global = true)]
    verbose: bool,
    /// Project ID; overrides the directory's `.cli-do-project` binding.
    #[arg(short, long, global = true)]
    project: Option<String>,
    /// Directory holding config.json and auth.json (default: ~/.config/cli-do).
    #[arg(long, global = true, env = "CLI_DO_CONFIG_DIR")]
    config_dir: Option<PathBuf>,
    /// API endpoint, overriding the one in config.json.
    #[arg(long, global = true, env = "CLI_DO_ENDPOINT")]
    endpoint: Option<String>,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Log in to cli-do and store the session token.
    #[command(visible_alias = "l")]
    Login(LoginArgs),

    /// Todo operations.
    #[command(visible_alias = "t")]
    Todo(TodoArgs),

    /// Project operations.
    #[command(visible_alias = "p")]
    Project(ProjectArgs),
}

#[derive(Debug, Args)]
struct TodoArgs {
    #[command(subcommand)]
    command: TodoCommand,
}

#[derive(Debug, Args)]
struct ProjectArgs {
    #[command(subcommand)]
    command: ProjectCommand,
}

#[derive(Debug, Args)]
struct LoginArgs {
    /// Log in again even if a session already exists.
    #[arg(short, long)]
    force: bool,
}

#[derive(Debug, Subcommand)]
enum TodoCommand {
    /// List the project's todos.
    #[command(visible_alias = "ls")]
    List(TodoListArgs),
    /// Show a single todo.
    #[command(visible_alias = "g")]
    Get(TicketArg),
    /// Edit a todo in $EDITOR.
    #[command(visible_alias = "e")]
    Edit(TicketArg),
    /// Create a todo.
    #[command(visible_alias = "n")]
    New(NewTodoArgs),
    /// Archive a todo.
    #[command(visible_alias = "a")]
    Archive(TicketArg),
    /// Mark a todo as completed.
    #[command(visible_alias = "co")]
    Complete(TicketArg),
}

#[derive(Debug, Args)]
struct TodoListArgs {
    /// Include completed todos.
    #[arg(short, long)]
    all: bool,
}

#[derive(Debug, Args)]
struct TicketArg {
    /// Ticket number of the todo within the project.
    ticket: u64,
}

#[derive(Debug, Args)]
struct NewTodoArgs {
    /// Subject of the todo.
    #[arg(short, long)]
    subject: String,
    /// Body of the todo.
    #[arg(short, long, default_value = "")]
    body: String,
    /// Due date of the todo (YYYY-MM-DD).
    #[arg(short, long)]
    due_date: Option<NaiveDate>,
}

#[derive(Debug, Subcommand)]
enum ProjectCommand {
    /// Bind the current directory to a project.
    #[command(visible_alias = "i")]
    Init(ProjectIdArg),
    /// Create a project.
    #[command(visible_alias = "n")]
    New(NewProjectArgs),
    /// List projects.
    #[command(visible_alias = "ls")]
    List,
    /// Archive a project.
    #[command(visible_alias = "a")]
    Archive(ProjectIdArg),
}

#[derive(Debug, Args)]
struct ProjectIdArg {
    project_id: String,
}

#[derive(Debug, Args)]
struct NewProjectArgs {
    /// Name of the project.
    #[arg(short, long)]
    name: String,
    /// Description of the project.
    #[arg(short, long, default_value = "")]
    description: String,
}

fn main() -> ExitCode {
    let cli = Cli::parse();
    init_tracing(cli.verbose);
    match run(cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("error: {err:#}");
            ExitCode::FAILURE
        }
    }
}

fn init_tracing(verbose: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        if verbose {
            EnvFilter::new("clido=debug,cli_do=debug,warn")
        } else {
            EnvFilter::new("warn")
        }
    });
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .with_target(false)
        .init();
}

fn run(cli: Cli) -> Result<()> {
    let workdir = env::current_dir().context("resolving the current directory")?;
    let config_dir = ConfigDir::resolve(cli.config_dir)?;
    let ctx = Context::load(config_dir, cli.endpoint, cli.project, workdir)
        .context("loading configuration")?;

    match cli.command {
        Commands::Login(args) => handle_login(&ctx, args),
        Commands::Todo(todo) => match todo.command {
            TodoCommand::List(args) => handle_todo_list(&ctx, args),
            TodoCommand::Get(args) => handle_todo_get(&ctx, args),
            TodoCommand::Edit(args) => handle_todo_edit(&ctx, args),
            TodoCommand::New(args) => handle_todo_new(&ctx, args),
            TodoCommand::Archive(args) => handle_todo_archive(&ctx, args),
            TodoCommand::Complete(args) => handle_todo_complete(&ctx, args),
        },
        Commands::Project(project) => match project.command {
            ProjectCommand::Init(args) => handle_project_init(&ctx, args),
            ProjectCommand::New(args) => handle_project_new(&ctx, args),
            ProjectCommand::List => handle_project_list(&ctx),
            ProjectCommand::Archive(args) => handle_project_archive(&ctx, args),
        },
    }
}

/// Authenticated client for everything but `login`.
fn api_client(ctx: &Context) -> Result<ApiClient> {
    Ok(ApiClient::new(ctx.endpoint()?, Some(ctx.token()?))?)
}

fn prompt_line<R: BufRead, W: Write>(input: &mut R, output: &mut W, label: &str) -> Result<String> {
    write!(output, "{label}: ")?;
    output.flush()?;
    let mut line = String::new();
    input
        .read_line(&mut line)
        .with_context(|| format!("reading {}", label.to_lowercase()))?;
    let value = line.trim_end_matches(['\r', '\n']).to_string();
    if value.is_empty() {
        anyhow::bail!("{} must not be empty", label.to_lowercase());
    }
    Ok(value)
}

/// Prompt for a secret on the terminal without echoing it.
fn prompt_password(label: &str) -> Result<String> {
    let mut output = io::stdout();
    write!(output, "{label}: ")?;
    output.flush()?;

    terminal::enable_raw_mode().context("enabling raw terminal mode")?;
    let read = read_hidden_line(event::read);
    let restored = terminal::disable_raw_mode();
    // Enter is swallowed in raw mode.
    println!();
    restored.context("restoring terminal mode")?;

    let value = read?;
    if value.is_empty() {
        anyhow::bail!("{} must not be empty", label.to_lowercase());
    }
    Ok(value)
}

/// Collect typed characters until Enter; Esc or Ctrl-C cancels.
fn read_hidden_line<F>(mut next_event: F) -> Result<String>
where
    F: FnMut() -> io::Result<Event>,
{
    let mut value = String::new();
    loop {
        let Event::Key(KeyEvent {
            code,
            modifiers,
            kind,
            ..
        }) = next_event().context("reading terminal input")?
        else {
            continue;
        };
        if kind == KeyEventKind::Release {
            continue;
        }
        match code {
            KeyCode::Enter => return Ok(value),
            KeyCode::Esc => anyhow::bail!("input cancelled"),
            KeyCode::Char('c') if modifiers.contains(KeyModifiers::CONTROL) => {
                anyhow::bail!("input cancelled")
            }
            KeyCode::Char(c) => value.push(c),
            KeyCode::Backspace => {
                value.pop();
            }
            _ => {}
        }
    }
}

fn handle_login(ctx: &Context, args: LoginArgs) -> Result<()> {
    if ctx.session().is_some() && !args.force {
        println!("You are already logged in!");
        return Ok(());
    }

    let stdin = io::stdin();
    let mut input = stdin.lock();
    let mut output = io::stdout();
    println!("Login to cli-do");
    let email = prompt_line(&mut input, &mut output, "Email")?;
    let password = if io::stdin().is_terminal() {
        prompt_password("Password")?
    } else {
        prompt_line(&mut input, &mut output, "Password")?
    };

    println!("Logging in...");
    let client = ApiClient::new(ctx.endpoint()?, None)?;
    let auth = client
        .login(&Login {
            email,
            password,
            client_id: ctx.config().client_id.clone(),
        })
        .context("logging in")?;
    config::save_session(ctx.config_dir(), &auth).context("saving session")?;
    debug!(path = %ctx.config_dir().auth_file().display(), "saved session");
    println!("Welcome to cli-do!");
    Ok(())
}

fn handle_todo_list(ctx: &Context, args: TodoListArgs) -> Result<()> {
    let project_id = ctx.project_id()?;
    let todos = api_client(ctx)?
        .todos(project_id, args.all)
        .with_context(|| format!("listing todos for project {project_id}"))?;

    if todos.is_empty() {
        eprintln!("No todos found.");
        return Ok(());
    }
    print!("{}", render::todo_table(&todos).render());
    Ok(())
}

fn handle_todo_get(ctx: &Context, args: TicketArg) -> Result<()> {
    let project_id = ctx.project_id()?;
    let todo = api_client(ctx)?
        .todo(project_id, args.ticket)
        .with_context(|| format!("fetching todo #{}", args.ticket))?;
    print!("{}", render::todo_detail(&todo));
    Ok(())
}

fn handle_todo_edit(ctx: &Context, args: TicketArg) -> Result<()> {
    let project_id = ctx.project_id()?;
    let client = api_client(ctx)?;
    let session = EditSession::new(
        &client,
        &InheritedTerminal,
        Editor::from_env(),
        ctx.workdir().to_path_buf(),
    );

    match session.run(project_id, args.ticket)? {
        EditOutcome::Updated(_) => println!("Todo updated successfully!"),
        EditOutcome::Abandoned { reason } => println!("Edit abandoned: {reason}"),
    }
    Ok(())
}

fn handle_todo_new(ctx: &Context, args: NewTodoArgs) -> Result<()> {
    let project_id = ctx.project_id()?;
    let NewTodoArgs {
        subject,
        body,
        due_date,
    } = args;
    let created = api_client(ctx)?
        .create_todo(
            project_id,
            &NewTodo {
                subject,
                body,
                due_date,
            },
        )
        .context("creating todo")?;
    println!("Todo #{} created successfully!", created.ticket);
    Ok(())
}

fn handle_todo_archive(ctx: &Context, args: TicketArg) -> Result<()> {
    let project_id = ctx.project_id()?;
    api_client(ctx)?
        .archive_todo(project_id, args.ticket)
        .with_context(|| format!("archiving todo #{}", args.ticket))?;
    println!("Todo archived successfully!");
    Ok(())
}

fn handle_todo_complete(ctx: &Context, args: TicketArg) -> Result<()> {
    let project_id = ctx.project_id()?;
    api_client(ctx)?
        .complete_todo(project_id, args.ticket)
        .with_context(|| format!("completing todo #{}", args.ticket))?;
    println!("Todo completed successfully!");
    Ok(())
}

fn handle_project_init(ctx: &Context, args: ProjectIdArg) -> Result<()> {
    if ctx.bound_project().is_some() {
        println!("Project directory already initialized!");
        return Ok(());
    }

    let project = api_client(ctx)?
        .project(&args.project_id)
        .with_context(|| format!("fetching project {}", args.project_id))?;
    let project_id = if project.id.is_empty() {
        args.project_id
    } else {
        project.id
    };
    let path = config::write_project_file(ctx.workdir(), &DirectorySettings { project_id })?;
    debug!(path = %path.display(), "wrote project binding");
    println!("Project directory initialized successfully!");
    Ok(())
}

fn handle_project_new(ctx: &Context, args: NewProjectArgs) -> Result<()> {
    let NewProjectArgs { name, description } = args;
    let project = api_client(ctx)?
        .create_project(&NewProject { name, description })
        .context("creating project")?;
    println!("Project {} created successfully!", project.id);
    Ok(())
}

fn handle_project_list(ctx: &Context) -> Result<()> {
    let projects = api_client(ctx)?.projects().context("listing projects")?;
    if projects.is_empty() {
        eprintln!("No projects found.");
        return Ok(());
    }
    print!("{}", render::project_table(&projects).render());
    Ok(())
}

fn handle_project_archive(ctx: &Context, args: ProjectIdArg) -> Result<()> {
    api_client(ctx)?
        .archive_project(&args.project_id)
        .with_context(|| format!("archiving project {}", args.project_id))?;
    println!("Project archived successfully!");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use std::io::Cursor;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn parses_global_project_and_aliases() {
        let cli = Cli::try_parse_from(["cli-do", "-p", "proj-1", "t", "e", "42"]).expect("parse");
        assert_eq!(cli.project.as_deref(), Some("proj-1"));
        match cli.command {
            Commands::Todo(TodoArgs {
                command: TodoCommand::Edit(TicketArg { ticket }),
            }) => assert_eq!(ticket, 42),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn new_todo_parses_due_date() {
        let cli = Cli::try_parse_from([
            "cli-do",
            "todo",
            "new",
            "--subject",
            "Ship",
            "--due-date",
            "2024-06-01",
        ])
        .expect("parse");
        match cli.command {
            Commands::Todo(TodoArgs {
                command: TodoCommand::New(args),
            }) => {
                assert_eq!(args.subject, "Ship");
                assert_eq!(args.body, "");
                assert_eq!(args.due_date, NaiveDate::from_ymd_opt(2024, 6, 1));
            }
            other => panic!("unexpected command {other:?}"),
        }
        assert!(
            Cli::try_parse_from(["cli-do", "todo", "new", "-s", "x", "-d", "06/01/2024"]).is_err()
        );
    }

    #[test]
    fn prompt_line_trims_line_endings() {
        let mut input = Cursor::new("me@example.test\r\nhunter2\n");
        let mut output = Vec::new();
        let email = prompt_line(&mut input, &mut output, "Email").expect("email");
        let password = prompt_line(&mut input, &mut output, "Password").expect("password");
        assert_eq!(email, "me@example.test");
        assert_eq!(password, "hunter2");
        assert_eq!(String::from_utf8(output).expect("utf8"), "Email: Password: ");
    }

    fn keys(codes: Vec<KeyEvent>) -> impl FnMut() -> io::Result<Event> {
        let mut events = codes.into_iter().map(Event::Key);
        move || {
            events
                .next()
                .ok_or_else(|| io::Error::new(io::ErrorKind::UnexpectedEof, "no more keys"))
        }
    }

    fn press(code: KeyCode) -> KeyEvent {
        KeyEvent::new(code, KeyModifiers::NONE)
    }

    #[test]
    fn hidden_line_handles_backspace_and_enter() {
        let typed = keys(vec![
            press(KeyCode::Char('h')),
            press(KeyCode::Char('x')),
            press(KeyCode::Backspace),
            press(KeyCode::Char('i')),
            press(KeyCode::Enter),
        ]);
        assert_eq!(read_hidden_line(typed).expect("password"), "hi");
    }

    #[test]
    fn hidden_line_cancels_on_ctrl_c() {
        let typed = keys(vec![
            press(KeyCode::Char('a')),
            KeyEvent::new(KeyCode::Char('c'), KeyModifiers::CONTROL),
        ]);
        assert!(read_hidden_line(typed).is_err());
    }

    #[test]
    fn hidden_line_fails_when_input_ends() {
        let typed = keys(vec![press(KeyCode::Char('a'))]);
        assert!(read_hidden_line(typed).is_err());
    }

    #[test]
    fn prompt_line_rejects_empty_input() {
        let mut input = Cursor::new("\n");
        let mut output = Vec::new();
        assert!(prompt_line(&mut input, &mut output, "Email").is_err());
    }
}
