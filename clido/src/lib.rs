//! Client library for the cli-do todo service.
//! The API layer is plain REST plumbing; the interesting part is `header`, which
//! round-trips a todo through a plain-text file so it can be edited in `$EDITOR`.

pub mod core {
    use chrono::NaiveDate;
    use serde::{Deserialize, Serialize};
    use serde_with::{DefaultOnNull, serde_as};

    /// Date layout used on the wire and in the edit file header.
    pub const DATE_FORMAT: &str = "%Y-%m-%d";

    /* ------------------------------ Entities ------------------------------ */

    /// A todo as exchanged with the API.
    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Todo {
        /// Internal record id; opaque to the client.
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub id: String,

        /// Human-facing sequential identifier within a project.
        pub ticket: u64,

        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub subject: String,

        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub body: String,

        /// Calendar date only; `null` on the wire when absent.
        #[serde(default, with = "serde_due_date")]
        pub due_date: Option<NaiveDate>,

        #[serde(default)]
        pub completed: bool,

        /// Computed by the server; never sent back meaningfully.
        #[serde(default)]
        pub past_due: bool,
    }

    #[serde_as]
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Project {
        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub id: String,

        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub name: String,

        #[serde_as(as = "DefaultOnNull")]
        #[serde(default)]
        pub description: String,

        #[serde(default)]
        pub ticket: u64,

        #[serde(default)]
        pub todos: Vec<Todo>,
    }

    /* ---------------------------- Request bodies ---------------------------- */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct NewTodo {
        pub subject: String,
        pub body: String,
        #[serde(with = "serde_due_date")]
        pub due_date: Option<NaiveDate>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct NewProject {
        pub name: String,
        pub description: String,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize)]
    pub struct Login {
        pub email: String,
        pub password: String,
        pub client_id: String,
    }

    /// Session returned by `/login` and persisted to `auth.json`.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Auth {
        #[serde(default)]
        pub email: String,
        #[serde(default)]
        pub access_token: String,
        #[serde(default)]
        pub token_type: String,
        #[serde(default)]
        pub expires_in: i64,
        #[serde(default)]
        pub refresh_token: String,
        #[serde(default)]
        pub created_at: i64,
    }

    /// Contents of the `.cli-do-project` file binding a directory to a project.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct DirectorySettings {
        #[serde(default)]
        pub project_id: String,
    }

    /* ------------------------------ Envelopes ------------------------------ */

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct TodoEnvelope<T> {
        pub todo: T,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
    pub struct ProjectEnvelope<T> {
        pub project: T,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
    pub struct TodoList {
        #[serde(default)]
        pub todos: Vec<Todo>,
    }

    #[derive(Debug, Clone, PartialEq, Eq, Default, Deserialize)]
    pub struct ProjectList {
        #[serde(default)]
        pub projects: Vec<Project>,
    }

    /// The server is not consistent about wrapping single records, so accept both.
    #[derive(Debug, Clone, Deserialize)]
    #[serde(untagged)]
    pub enum TodoResponse {
        Wrapped(TodoEnvelope<Todo>),
        Bare(Todo),
    }

    impl TodoResponse {
        pub fn into_inner(self) -> Todo {
            match self {
                Self::Wrapped(envelope) => envelope.todo,
                Self::Bare(todo) => todo,
            }
        }
    }

    #[derive(Debug, Clone, Deserialize)]
    #[serde(untagged)]
    pub enum ProjectResponse {
        Wrapped(ProjectEnvelope<Project>),
        Bare(Project),
    }

    impl ProjectResponse {
        pub fn into_inner(self) -> Project {
            match self {
                Self::Wrapped(envelope) => envelope.project,
                Self::Bare(project) => project,
            }
        }
    }

    /* ----------------------------- Due dates ----------------------------- */

    /// Accepts `YYYY-MM-DD` or a full RFC 3339 timestamp; always writes `YYYY-MM-DD`.
    pub mod serde_due_date {
        use super::DATE_FORMAT;
        use chrono::{DateTime, NaiveDate};
        use serde::{Deserialize, Deserializer, Serializer, de::Error};

        pub fn serialize<S>(value: &Option<NaiveDate>, serializer: S) -> Result<S::Ok, S::Error>
        where
            S: Serializer,
        {
            match value {
                Some(date) => serializer.serialize_some(&date.format(DATE_FORMAT).to_string()),
                None => serializer.serialize_none(),
            }
        }

        pub fn deserialize<'de, D>(deserializer: D) -> Result<Option<NaiveDate>, D::Error>
        where
            D: Deserializer<'de>,
        {
            let raw = Option::<String>::deserialize(deserializer)?;
            match raw.as_deref().map(str::trim) {
                None | Some("") => Ok(None),
                Some(text) => parse_api_date(text)
                    .map(Some)
                    .ok_or_else(|| D::Error::custom(format!("invalid due date {text:?}"))),
            }
        }

        pub fn parse_api_date(text: &str) -> Option<NaiveDate> {
            NaiveDate::parse_from_str(text, DATE_FORMAT)
                .ok()
                .or_else(|| DateTime::parse_from_rfc3339(text).ok().map(|dt| dt.date_naive()))
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;

        #[test]
        fn due_date_accepts_plain_dates_and_timestamps() {
            let plain: Todo =
                serde_json::from_str(r#"{"ticket": 1, "due_date": "2024-06-01"}"#).expect("plain");
            let stamped: Todo =
                serde_json::from_str(r#"{"ticket": 1, "due_date": "2024-06-01T00:00:00Z"}"#)
                    .expect("stamped");
            let expected = NaiveDate::from_ymd_opt(2024, 6, 1);
            assert_eq!(plain.due_date, expected);
            assert_eq!(stamped.due_date, expected);
        }

        #[test]
        fn null_fields_fall_back_to_defaults() {
            let todo: Todo = serde_json::from_str(
                r#"{"id": null, "ticket": 3, "subject": "Hi", "body": null, "due_date": null}"#,
            )
            .expect("todo");
            assert_eq!(todo.id, "");
            assert_eq!(todo.body, "");
            assert_eq!(todo.due_date, None);
            assert!(!todo.completed);
        }

        #[test]
        fn update_payload_sends_date_or_null() {
            let mut todo = Todo {
                ticket: 9,
                due_date: NaiveDate::from_ymd_opt(2025, 1, 31),
                ..Todo::default()
            };
            let json = serde_json::to_value(TodoEnvelope { todo: &todo }).expect("json");
            assert_eq!(json["todo"]["due_date"], "2025-01-31");

            todo.due_date = None;
            let json = serde_json::to_value(TodoEnvelope { todo: &todo }).expect("json");
            assert!(json["todo"]["due_date"].is_null());
        }

        #[test]
        fn single_records_decode_wrapped_or_bare() {
            let wrapped: TodoResponse =
                serde_json::from_str(r#"{"todo": {"ticket": 4, "subject": "A"}}"#).expect("wrapped");
            let bare: TodoResponse =
                serde_json::from_str(r#"{"ticket": 4, "subject": "A"}"#).expect("bare");
            assert_eq!(wrapped.into_inner(), bare.into_inner());

            let project: ProjectResponse =
                serde_json::from_str(r#"{"project": {"id": "p-1", "name": "Home"}}"#)
                    .expect("project");
            assert_eq!(project.into_inner().name, "Home");
        }
    }
}

pub mod header {
    //! Edit-file format: a fixed block of `# Key: Value` lines, a blank separator, then
    //! the body verbatim.
    //!
    //! Parsing is lenient. Unknown keys, malformed lines, commentary and bad dates never
    //! fail an edit; they simply produce no update for the field. The header block ends
    //! at the first blank line.

    use crate::core::{DATE_FORMAT, Todo};
    use chrono::NaiveDate;
    use nom::{
        IResult,
        branch::alt,
        bytes::complete::tag,
        character::complete::{char, space0, space1},
        combinator::{map, rest, value},
        error::VerboseError,
        sequence::tuple,
    };
    use std::{
        fmt::Write as _,
        fs,
        io::{self, Write as _},
        path::Path,
    };
    use tempfile::TempPath;
    use tracing::debug;

    /// Prefix of the temp files created for editing.
    pub const TEMP_PREFIX: &str = ".todo-";

    /// Literal written for an absent due date.
    pub const NONE_SENTINEL: &str = "none";

    /* ------------------------------- Grammar ------------------------------- */

    /// Recognized header keys, in emission order.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
    pub enum HeaderKey {
        Ticket,
        Subject,
        Completed,
        DueDate,
    }

    impl HeaderKey {
        pub const ALL: [HeaderKey; 4] = [
            HeaderKey::Ticket,
            HeaderKey::Subject,
            HeaderKey::Completed,
            HeaderKey::DueDate,
        ];

        pub fn as_str(self) -> &'static str {
            match self {
                HeaderKey::Ticket => "Ticket",
                HeaderKey::Subject => "Subject",
                HeaderKey::Completed => "Completed",
                HeaderKey::DueDate => "DueDate",
            }
        }
    }

    type PResult<'a, T> = IResult<&'a str, T, VerboseError<&'a str>>;

    fn header_key(i: &str) -> PResult<'_, HeaderKey> {
        alt((
            value(HeaderKey::Ticket, tag("Ticket")),
            value(HeaderKey::Subject, tag("Subject")),
            value(HeaderKey::Completed, tag("Completed")),
            value(HeaderKey::DueDate, tag("DueDate")),
        ))(i)
    }

    fn header_line(i: &str) -> PResult<'_, (HeaderKey, &str)> {
        // # Key: value
        map(
            tuple((
                char('#'),
                space1,
                header_key,
                space0,
                char(':'),
                space1,
                rest,
            )),
            |(_, _, key, _, _, _, val)| (key, val),
        )(i)
    }

    /// Match a single line (without its terminator) against the header grammar.
    pub fn parse_header_line(line: &str) -> Option<(HeaderKey, &str)> {
        header_line(line).ok().map(|(_, kv)| kv)
    }

    /* ---------------------------- Field updates ---------------------------- */

    /// Outcome of scanning the header for one field.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum FieldUpdate<T> {
        NoChange,
        SetTo(T),
    }

    impl<T> Default for FieldUpdate<T> {
        fn default() -> Self {
            Self::NoChange
        }
    }

    impl<T> FieldUpdate<T> {
        pub fn is_change(&self) -> bool {
            matches!(self, Self::SetTo(_))
        }

        pub fn apply_to(self, target: &mut T) {
            if let Self::SetTo(v) = self {
                *target = v;
            }
        }
    }

    /// Every field the header can change. `Ticket` is display-only and has no slot here.
    #[derive(Debug, Clone, PartialEq, Eq, Default)]
    pub struct HeaderUpdate {
        pub subject: FieldUpdate<String>,
        pub completed: FieldUpdate<bool>,
        pub due_date: FieldUpdate<Option<NaiveDate>>,
    }

    impl HeaderUpdate {
        /// Record one matched header line. Later lines win over earlier ones.
        pub fn record(&mut self, key: HeaderKey, val: &str) {
            match key {
                HeaderKey::Ticket => {}
                HeaderKey::Subject => self.subject = FieldUpdate::SetTo(val.to_string()),
                HeaderKey::Completed => self.completed = FieldUpdate::SetTo(val == "true"),
                HeaderKey::DueDate => self.due_date = FieldUpdate::SetTo(parse_due_date(val)),
            }
        }

        pub fn apply(self, original: &Todo) -> Todo {
            let mut todo = original.clone();
            self.subject.apply_to(&mut todo.subject);
            self.completed.apply_to(&mut todo.completed);
            self.due_date.apply_to(&mut todo.due_date);
            todo
        }
    }

    /// `none` and anything that is not a valid `YYYY-MM-DD` date both mean "no due date".
    pub fn parse_due_date(val: &str) -> Option<NaiveDate> {
        if val == NONE_SENTINEL {
            return None;
        }
        match NaiveDate::parse_from_str(val, DATE_FORMAT) {
            Ok(date) => Some(date),
            Err(err) => {
                debug!(value = val, error = %err, "unparseable due date, clearing it");
                None
            }
        }
    }

    /* ------------------------------ Serializer ------------------------------ */

    /// Render the edit file text for `todo`.
    pub fn render_edit_file(todo: &Todo) -> String {
        let mut out = String::new();
        let subject = todo.subject.replace(['\r', '\n'], " ");
        let due = todo
            .due_date
            .map(|d| d.format(DATE_FORMAT).to_string())
            .unwrap_or_else(|| NONE_SENTINEL.to_string());

        for key in HeaderKey::ALL {
            let val = match key {
                HeaderKey::Ticket => todo.ticket.to_string(),
                HeaderKey::Subject => subject.clone(),
                HeaderKey::Completed => todo.completed.to_string(),
                HeaderKey::DueDate => due.clone(),
            };
            let _ = writeln!(out, "# {}: {}", key.as_str(), val);
        }
        out.push('\n');
        out.push_str(&todo.body);
        // Terminating newline; the parser drops exactly one.
        out.push('\n');
        out
    }

    /// Write `todo` to a fresh, owner-only temp file in `dir`.
    ///
    /// The returned `TempPath` deletes the file when dropped. If writing fails the
    /// half-written file is removed before the error is returned.
    pub fn write_temp_file(todo: &Todo, dir: &Path) -> io::Result<TempPath> {
        let mut file = tempfile::Builder::new()
            .prefix(TEMP_PREFIX)
            .tempfile_in(dir)?;
        file.write_all(render_edit_file(todo).as_bytes())?;
        file.flush()?;
        debug!(path = %file.path().display(), ticket = todo.ticket, "wrote edit file");
        Ok(file.into_temp_path())
    }

    /* -------------------------------- Parser -------------------------------- */

    /// Result of parsing an edited file.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ParsedEdit {
        pub todo: Todo,
        pub header: HeaderUpdate,
        /// Zero-based line index where the body starts.
        pub body_start: usize,
    }

    fn edit_lines(text: &str) -> Vec<&str> {
        let text = text.strip_suffix('\n').unwrap_or(text);
        text.split('\n')
            .map(|line| line.strip_suffix('\r').unwrap_or(line))
            .collect()
    }

    /// Parse edited file text, using `original` for every field the header leaves alone.
    pub fn parse_edit_text(original: &Todo, text: &str) -> ParsedEdit {
        let lines = edit_lines(text);
        let mut header = HeaderUpdate::default();
        let mut body_start = lines.len();

        for (idx, line) in lines.iter().enumerate() {
            if line.trim().is_empty() {
                body_start = idx + 1;
                break;
            }
            match parse_header_line(line) {
                Some((key, val)) => header.record(key, val),
                None => debug!(line = idx + 1, "skipping unrecognized header line"),
            }
        }

        let mut todo = header.clone().apply(original);
        todo.body = lines[body_start..].join("\n");

        ParsedEdit {
            todo,
            header,
            body_start,
        }
    }

    pub fn parse_temp_file(original: &Todo, path: &Path) -> io::Result<ParsedEdit> {
        let text = fs::read_to_string(path)?;
        Ok(parse_edit_text(original, &text))
    }

}

pub mod storage {
    //! Seams between the edit workflow and the outside world.

    use crate::api::ApiError;
    use crate::core::Todo;
    use crate::edit::{Editor, ExitOutcome};
    use std::{io, path::Path};

    /// Remote todo store, addressed by project and ticket.
    pub trait TodoService {
        fn get_todo(&self, project_id: &str, ticket: u64) -> Result<Todo, ApiError>;

        fn update_todo(&self, project_id: &str, ticket: u64, todo: &Todo) -> Result<(), ApiError>;
    }

    /// Runs an external program to completion, attached to the caller's terminal.
    pub trait ProgramRunner {
        /// Launch `editor` on `file` and block until it exits.
        fn run(&self, editor: &Editor, file: &Path) -> io::Result<ExitOutcome>;
    }
}

pub mod config {
    //! Startup configuration: config dir, `config.json`, `auth.json` and the
    //! directory's project binding, loaded once into a [`Context`].

    use crate::core::{Auth, DirectorySettings};
    use serde::{Deserialize, Serialize, de::DeserializeOwned};
    use std::{
        fs, io,
        path::{Path, PathBuf},
    };
    use tracing::debug;

    pub const CONFIG_FILE: &str = "config.json";
    pub const AUTH_FILE: &str = "auth.json";
    pub const PROJECT_FILE: &str = ".cli-do-project";

    #[derive(Debug, thiserror::Error)]
    pub enum ConfigError {
        #[error("could not determine the home directory")]
        NoHomeDir,
        #[error("reading {path:?}")]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("parsing {path:?}")]
        Parse {
            path: PathBuf,
            #[source]
            source: serde_json::Error,
        },
        #[error("writing {path:?}")]
        Write {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("no API endpoint configured; set \"endpoint\" in {path:?} or CLI_DO_ENDPOINT")]
        MissingEndpoint { path: PathBuf },
        #[error("not logged in; run `cli-do login` first")]
        NotLoggedIn,
        #[error("Project flag not provided and project directory not initialized.")]
        NoProject,
    }

    /// Contents of `config.json`.
    #[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
    pub struct Config {
        #[serde(default)]
        pub endpoint: String,
        #[serde(default)]
        pub client_id: String,
    }

    /// Directory holding `config.json` and `auth.json`.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct ConfigDir(PathBuf);

    impl ConfigDir {
        pub fn new(path: impl Into<PathBuf>) -> Self {
            Self(path.into())
        }

        /// `override_dir` if given, otherwise `$HOME/.config/cli-do`.
        pub fn resolve(override_dir: Option<PathBuf>) -> Result<Self, ConfigError> {
            if let Some(dir) = override_dir {
                return Ok(Self(dir));
            }
            let home = dirs::home_dir().ok_or(ConfigError::NoHomeDir)?;
            Ok(Self(home.join(".config").join("cli-do")))
        }

        pub fn path(&self) -> &Path {
            &self.0
        }

        pub fn config_file(&self) -> PathBuf {
            self.0.join(CONFIG_FILE)
        }

        pub fn auth_file(&self) -> PathBuf {
            self.0.join(AUTH_FILE)
        }
    }

    /// Read and decode a JSON file; a missing file is `Ok(None)`.
    fn read_json<T: DeserializeOwned>(path: &Path) -> Result<Option<T>, ConfigError> {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                debug!(path = %path.display(), "no such file");
                return Ok(None);
            }
            Err(source) => {
                return Err(ConfigError::Read {
                    path: path.to_path_buf(),
                    source,
                });
            }
        };
        serde_json::from_str(&text)
            .map(Some)
            .map_err(|source| ConfigError::Parse {
                path: path.to_path_buf(),
                source,
            })
    }

    /// Write a file readable only by its owner on Unix.
    fn write_private(path: &Path, contents: &[u8]) -> io::Result<()> {
        use std::io::Write;

        let mut options = fs::OpenOptions::new();
        options.write(true).create(true).truncate(true);
        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            options.mode(0o600);
        }
        let mut file = options.open(path)?;
        file.write_all(contents)
    }

    pub fn load_config(dir: &ConfigDir) -> Result<Config, ConfigError> {
        Ok(read_json(&dir.config_file())?.unwrap_or_default())
    }

    pub fn load_session(dir: &ConfigDir) -> Result<Option<Auth>, ConfigError> {
        read_json(&dir.auth_file())
    }

    pub fn save_session(dir: &ConfigDir, auth: &Auth) -> Result<(), ConfigError> {
        let path = dir.auth_file();
        fs::create_dir_all(dir.path()).map_err(|source| ConfigError::Write {
            path: dir.path().to_path_buf(),
            source,
        })?;
        let json = serde_json::to_vec_pretty(auth).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        write_private(&path, &json).map_err(|source| ConfigError::Write { path, source })
    }

    pub fn read_project_file(workdir: &Path) -> Result<Option<DirectorySettings>, ConfigError> {
        let settings: Option<DirectorySettings> = read_json(&workdir.join(PROJECT_FILE))?;
        Ok(settings.filter(|s| !s.project_id.is_empty()))
    }

    pub fn write_project_file(
        workdir: &Path,
        settings: &DirectorySettings,
    ) -> Result<PathBuf, ConfigError> {
        let path = workdir.join(PROJECT_FILE);
        let json = serde_json::to_vec(settings).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        fs::write(&path, json).map_err(|source| ConfigError::Write {
            path: path.clone(),
            source,
        })?;
        Ok(path)
    }

    /// Everything a command needs to know about its environment.
    #[derive(Debug, Clone)]
    pub struct Context {
        config_dir: ConfigDir,
        config: Config,
        session: Option<Auth>,
        project_flag: Option<String>,
        bound_project: Option<DirectorySettings>,
        workdir: PathBuf,
    }

    impl Context {
        pub fn load(
            config_dir: ConfigDir,
            endpoint_override: Option<String>,
            project_flag: Option<String>,
            workdir: PathBuf,
        ) -> Result<Self, ConfigError> {
            let mut config = load_config(&config_dir)?;
            if let Some(endpoint) = endpoint_override.filter(|e| !e.is_empty()) {
                config.endpoint = endpoint;
            }
            let session = load_session(&config_dir)?;
            let bound_project = read_project_file(&workdir)?;
            debug!(
                config_dir = %config_dir.path().display(),
                logged_in = session.is_some(),
                bound_project = bound_project.is_some(),
                "loaded context"
            );
            Ok(Self {
                config_dir,
                config,
                session,
                project_flag: project_flag.filter(|p| !p.is_empty()),
                bound_project,
                workdir,
            })
        }

        pub fn config_dir(&self) -> &ConfigDir {
            &self.config_dir
        }

        pub fn config(&self) -> &Config {
            &self.config
        }

        pub fn session(&self) -> Option<&Auth> {
            self.session.as_ref()
        }

        pub fn workdir(&self) -> &Path {
            &self.workdir
        }

        pub fn endpoint(&self) -> Result<&str, ConfigError> {
            if self.config.endpoint.is_empty() {
                return Err(ConfigError::MissingEndpoint {
                    path: self.config_dir.config_file(),
                });
            }
            Ok(&self.config.endpoint)
        }

        pub fn token(&self) -> Result<&str, ConfigError> {
            self.session
                .as_ref()
                .map(|auth| auth.access_token.as_str())
                .filter(|token| !token.is_empty())
                .ok_or(ConfigError::NotLoggedIn)
        }

        /// The `.cli-do-project` binding for the working directory, ignoring `--project`.
        pub fn bound_project(&self) -> Option<&DirectorySettings> {
            self.bound_project.as_ref()
        }

        /// `--project` wins over the directory binding.
        pub fn project_id(&self) -> Result<&str, ConfigError> {
            self.project_flag
                .as_deref()
                .or(self.bound_project.as_ref().map(|s| s.project_id.as_str()))
                .ok_or(ConfigError::NoProject)
        }
    }

}

pub mod api {
    //! Blocking REST client for the cli-do service.

    use crate::core::{
        Auth, Login, NewProject, NewTodo, Project, ProjectEnvelope, ProjectList, ProjectResponse,
        Todo, TodoEnvelope, TodoList, TodoResponse,
    };
    use crate::storage::TodoService;
    use reqwest::{
        Method, StatusCode,
        blocking::{Client, RequestBuilder},
        header::ACCEPT,
    };
    use serde::de::DeserializeOwned;
    use tracing::debug;

    #[derive(Debug, thiserror::Error)]
    pub enum ApiError {
        #[error("could not reach the cli-do API")]
        Transport(#[from] reqwest::Error),
        #[error("{message}")]
        Status { status: u16, message: String },
        #[error("unexpected response from the cli-do API")]
        Decode(#[from] serde_json::Error),
    }

    impl ApiError {
        pub fn status(&self) -> Option<u16> {
            match self {
                Self::Status { status, .. } => Some(*status),
                _ => None,
            }
        }
    }

    /// What a request was about, for error messages.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum Entity {
        Session,
        Project,
        Todo,
    }

    impl Entity {
        fn name(self) -> &'static str {
            match self {
                Entity::Session => "Session",
                Entity::Project => "Project",
                Entity::Todo => "Todo",
            }
        }
    }

    /// User-facing message for a non-success status.
    pub fn status_message(status: StatusCode, entity: Entity) -> String {
        match (status, entity) {
            (StatusCode::UNAUTHORIZED, Entity::Session) => "Invalid email or password.".into(),
            (StatusCode::UNAUTHORIZED, _) => {
                "Not authorized. Run `cli-do login` to refresh your session.".into()
            }
            (StatusCode::NOT_FOUND, entity) => format!(
                "{} not found. Please check the {}'s ID.",
                entity.name(),
                entity.name().to_lowercase()
            ),
            (s, _) if s.is_server_error() => "Internal server error.".into(),
            (s, _) => format!("Unexpected response ({s})."),
        }
    }

    fn join_url(base: &str, path: &str) -> String {
        format!(
            "{}/{}",
            base.trim_end_matches('/'),
            path.trim_start_matches('/')
        )
    }

    pub struct ApiClient {
        http: Client,
        base: String,
        token: Option<String>,
    }

    impl ApiClient {
        pub fn new(endpoint: &str, token: Option<&str>) -> Result<Self, ApiError> {
            let http = Client::builder()
                .user_agent(concat!("cli-do/", env!("CARGO_PKG_VERSION")))
                .build()?;
            Ok(Self {
                http,
                base: endpoint.to_string(),
                token: token.map(str::to_string),
            })
        }

        fn request(&self, method: Method, path: &str) -> RequestBuilder {
            let builder = self
                .http
                .request(method, join_url(&self.base, path))
                .header(ACCEPT, "application/json");
            match &self.token {
                Some(token) => builder.bearer_auth(token),
                None => builder,
            }
        }

        /// Send and return the body text of a successful response.
        fn execute(&self, builder: RequestBuilder, entity: Entity) -> Result<String, ApiError> {
            let response = builder.send()?;
            let status = response.status();
            debug!(%status, url = %response.url(), "api response");
            if !status.is_success() {
                return Err(ApiError::Status {
                    status: status.as_u16(),
                    message: status_message(status, entity),
                });
            }
            Ok(response.text()?)
        }

        fn fetch<T: DeserializeOwned>(
            &self,
            builder: RequestBuilder,
            entity: Entity,
        ) -> Result<T, ApiError> {
            let body = self.execute(builder, entity)?;
            Ok(serde_json::from_str(&body)?)
        }

        pub fn login(&self, login: &Login) -> Result<Auth, ApiError> {
            self.fetch(
                self.request(Method::POST, "login").json(login),
                Entity::Session,
            )
        }

        pub fn projects(&self) -> Result<Vec<Project>, ApiError> {
            let list: ProjectList =
                self.fetch(self.request(Method::GET, "projects"), Entity::Project)?;
            Ok(list.projects)
        }

        pub fn project(&self, project_id: &str) -> Result<Project, ApiError> {
            let response: ProjectResponse = self.fetch(
                self.request(Method::GET, &format!("projects/{project_id}")),
                Entity::Project,
            )?;
            Ok(response.into_inner())
        }

        pub fn create_project(&self, project: &NewProject) -> Result<Project, ApiError> {
            let response: ProjectResponse = self.fetch(
                self.request(Method::POST, "projects")
                    .json(&ProjectEnvelope { project }),
                Entity::Project,
            )?;
            Ok(response.into_inner())
        }

        pub fn archive_project(&self, project_id: &str) -> Result<(), ApiError> {
            self.execute(
                self.request(Method::DELETE, &format!("projects/{project_id}")),
                Entity::Project,
            )
            .map(drop)
        }

        pub fn todos(&self, project_id: &str, all: bool) -> Result<Vec<Todo>, ApiError> {
            let list: TodoList = self.fetch(
                self.request(Method::GET, &format!("projects/{project_id}/todos"))
                    .query(&[("all", all)]),
                Entity::Todo,
            )?;
            Ok(list.todos)
        }

        pub fn todo(&self, project_id: &str, ticket: u64) -> Result<Todo, ApiError> {
            let response: TodoResponse = self.fetch(
                self.request(
                    Method::GET,
                    &format!("projects/{project_id}/todos/{ticket}"),
                ),
                Entity::Todo,
            )?;
            Ok(response.into_inner())
        }

        pub fn create_todo(&self, project_id: &str, todo: &NewTodo) -> Result<Todo, ApiError> {
            let response: TodoResponse = self.fetch(
                self.request(Method::POST, &format!("projects/{project_id}/todos"))
                    .json(&TodoEnvelope { todo }),
                Entity::Todo,
            )?;
            Ok(response.into_inner())
        }

        pub fn update_todo(&self, project_id: &str, ticket: u64, todo: &Todo) -> Result<(), ApiError> {
            self.execute(
                self.request(
                    Method::PUT,
                    &format!("projects/{project_id}/todos/{ticket}"),
                )
                .json(&TodoEnvelope { todo }),
                Entity::Todo,
            )
            .map(drop)
        }

        pub fn archive_todo(&self, project_id: &str, ticket: u64) -> Result<(), ApiError> {
            self.execute(
                self.request(
                    Method::DELETE,
                    &format!("projects/{project_id}/todos/{ticket}"),
                ),
                Entity::Todo,
            )
            .map(drop)
        }

        pub fn complete_todo(&self, project_id: &str, ticket: u64) -> Result<(), ApiError> {
            self.execute(
                self.request(
                    Method::POST,
                    &format!("projects/{project_id}/todos/{ticket}/complete"),
                ),
                Entity::Todo,
            )
            .map(drop)
        }
    }

    impl TodoService for ApiClient {
        fn get_todo(&self, project_id: &str, ticket: u64) -> Result<Todo, ApiError> {
            self.todo(project_id, ticket)
        }

        fn update_todo(&self, project_id: &str, ticket: u64, todo: &Todo) -> Result<(), ApiError> {
            ApiClient::update_todo(self, project_id, ticket, todo)
        }
    }

}

pub mod edit {
    //! The `todo edit` workflow:
    //! fetch, write temp file, run editor, parse, submit. The temp file is removed on
    //! every path out of [`EditSession::run`].

    use crate::api::ApiError;
    use crate::core::Todo;
    use crate::header;
    use crate::storage::{ProgramRunner, TodoService};
    use std::{
        fmt, io,
        path::{Path, PathBuf},
        process::{Command, Stdio},
    };
    use tempfile::TempPath;
    use tracing::{debug, info, warn};

    pub const DEFAULT_EDITOR: &str = "vim";

    /// Editor command line: a program plus leading arguments; the file is appended last.
    #[derive(Debug, Clone, PartialEq, Eq)]
    pub struct Editor {
        pub program: String,
        pub args: Vec<String>,
    }

    impl Editor {
        /// Build from an `$EDITOR`-style value, falling back to `vim` when unset or blank.
        pub fn resolve(var: Option<&str>) -> Self {
            let mut words = var.unwrap_or_default().split_whitespace().map(str::to_string);
            match words.next() {
                Some(program) => Self {
                    program,
                    args: words.collect(),
                },
                None => Self {
                    program: DEFAULT_EDITOR.to_string(),
                    args: vec![],
                },
            }
        }

        pub fn from_env() -> Self {
            Self::resolve(std::env::var("EDITOR").ok().as_deref())
        }
    }

    impl fmt::Display for Editor {
        fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
            f.write_str(&self.program)?;
            for arg in &self.args {
                write!(f, " {arg}")?;
            }
            Ok(())
        }
    }

    /// How the external program finished.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub enum ExitOutcome {
        Success,
        /// Non-zero exit; `None` when killed by a signal.
        Failed(Option<i32>),
    }

    /// Runs programs in the foreground with stdin/stdout/stderr inherited.
    pub struct InheritedTerminal;

    impl ProgramRunner for InheritedTerminal {
        fn run(&self, editor: &Editor, file: &Path) -> io::Result<ExitOutcome> {
            let status = Command::new(&editor.program)
                .args(&editor.args)
                .arg(file)
                .stdin(Stdio::inherit())
                .stdout(Stdio::inherit())
                .stderr(Stdio::inherit())
                .status()?;
            Ok(if status.success() {
                ExitOutcome::Success
            } else {
                ExitOutcome::Failed(status.code())
            })
        }
    }

    #[derive(Debug, thiserror::Error)]
    pub enum EditError {
        #[error("fetching todo #{ticket}")]
        Fetch {
            ticket: u64,
            #[source]
            source: ApiError,
        },
        #[error("creating the edit file in {dir:?}")]
        TempFile {
            dir: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("launching editor `{editor}`")]
        Launch {
            editor: String,
            #[source]
            source: io::Error,
        },
        #[error("reading the edited file {path:?}")]
        Read {
            path: PathBuf,
            #[source]
            source: io::Error,
        },
        #[error("updating todo #{ticket}")]
        Submit {
            ticket: u64,
            #[source]
            source: ApiError,
        },
    }

    #[derive(Debug, Clone, PartialEq, Eq)]
    pub enum EditOutcome {
        /// The edited todo was accepted by the service.
        Updated(Todo),
        /// The editor did not exit cleanly; nothing was submitted.
        Abandoned { reason: String },
    }

    pub struct EditSession<'a, S, R> {
        service: &'a S,
        runner: &'a R,
        editor: Editor,
        workdir: PathBuf,
    }

    impl<'a, S: TodoService, R: ProgramRunner> EditSession<'a, S, R> {
        pub fn new(service: &'a S, runner: &'a R, editor: Editor, workdir: PathBuf) -> Self {
            Self {
                service,
                runner,
                editor,
                workdir,
            }
        }

        pub fn run(&self, project_id: &str, ticket: u64) -> Result<EditOutcome, EditError> {
            let original = self
                .service
                .get_todo(project_id, ticket)
                .map_err(|source| EditError::Fetch { ticket, source })?;

            let temp = header::write_temp_file(&original, &self.workdir).map_err(|source| {
                EditError::TempFile {
                    dir: self.workdir.clone(),
                    source,
                }
            })?;

            let outcome = self.edit_and_submit(project_id, ticket, &original, &temp);
            release(temp);
            outcome
        }

        fn edit_and_submit(
            &self,
            project_id: &str,
            ticket: u64,
            original: &Todo,
            path: &Path,
        ) -> Result<EditOutcome, EditError> {
            info!(editor = %self.editor, path = %path.display(), ticket, "launching editor");
            let exit = self
                .runner
                .run(&self.editor, path)
                .map_err(|source| EditError::Launch {
                    editor: self.editor.to_string(),
                    source,
                })?;

            if let ExitOutcome::Failed(code) = exit {
                let reason = match code {
                    Some(code) => format!("editor `{}` exited with status {code}", self.editor),
                    None => format!("editor `{}` was terminated by a signal", self.editor),
                };
                warn!(ticket, "{reason}");
                return Ok(EditOutcome::Abandoned { reason });
            }

            let parsed =
                header::parse_temp_file(original, path).map_err(|source| EditError::Read {
                    path: path.to_path_buf(),
                    source,
                })?;
            debug!(ticket, header = ?parsed.header, "parsed edit file");

            self.service
                .update_todo(project_id, ticket, &parsed.todo)
                .map_err(|source| EditError::Submit { ticket, source })?;
            Ok(EditOutcome::Updated(parsed.todo))
        }
    }

    /// Best-effort removal; failures are logged, never returned.
    fn release(temp: TempPath) {
        let path = temp.to_path_buf();
        match temp.close() {
            Ok(()) => debug!(path = %path.display(), "removed edit file"),
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => warn!(path = %path.display(), error = %err, "failed to remove edit file"),
        }
    }

    #[cfg(test)]
    mod tests {
        use super::*;
        use std::{cell::RefCell, collections::HashMap, fs};

        struct InMemoryTodos {
            todos: RefCell<HashMap<u64, Todo>>,
            updates: RefCell<Vec<(String, u64, Todo)>>,
            fail_updates: bool,
        }

        impl InMemoryTodos {
            fn with(todo: Todo) -> Self {
                Self {
                    todos: RefCell::new(HashMap::from([(todo.ticket, todo)])),
                    updates: RefCell::new(vec![]),
                    fail_updates: false,
                }
            }
        }

        impl TodoService for InMemoryTodos {
            fn get_todo(&self, _project_id: &str, ticket: u64) -> Result<Todo, ApiError> {
                self.todos
                    .borrow()
                    .get(&ticket)
                    .cloned()
                    .ok_or_else(|| ApiError::Status {
                        status: 404,
                        message: "Todo not found.".into(),
                    })
            }

            fn update_todo(
                &self,
                project_id: &str,
                ticket: u64,
                todo: &Todo,
            ) -> Result<(), ApiError> {
                if self.fail_updates {
                    return Err(ApiError::Status {
                        status: 500,
                        message: "Internal server error.".into(),
                    });
                }
                self.updates
                    .borrow_mut()
                    .push((project_id.to_string(), ticket, todo.clone()));
                self.todos.borrow_mut().insert(ticket, todo.clone());
                Ok(())
            }
        }

        /// Stands in for the editor: runs `action` on the file and remembers its path.
        struct FakeEditor<F> {
            action: F,
            seen: RefCell<Option<PathBuf>>,
        }

        impl<F> FakeEditor<F>
        where
            F: Fn(&Path) -> io::Result<ExitOutcome>,
        {
            fn new(action: F) -> Self {
                Self {
                    action,
                    seen: RefCell::new(None),
                }
            }

            fn seen(&self) -> PathBuf {
                self.seen.borrow().clone().expect("editor was not run")
            }
        }

        impl<F> ProgramRunner for FakeEditor<F>
        where
            F: Fn(&Path) -> io::Result<ExitOutcome>,
        {
            fn run(&self, _editor: &Editor, file: &Path) -> io::Result<ExitOutcome> {
                *self.seen.borrow_mut() = Some(file.to_path_buf());
                assert!(file.exists(), "edit file must exist while the editor runs");
                (self.action)(file)
            }
        }

        fn todo_seven() -> Todo {
            Todo {
                id: "t-7".into(),
                ticket: 7,
                subject: "Old".into(),
                body: "line1".into(),
                due_date: None,
                completed: false,
                past_due: false,
            }
        }

        fn is_empty_dir(dir: &Path) -> bool {
            fs::read_dir(dir).expect("read_dir").next().is_none()
        }

        #[test]
        fn successful_edit_submits_parsed_todo_and_cleans_up() {
            let dir = tempfile::tempdir().expect("tempdir");
            let service = InMemoryTodos::with(todo_seven());
            let editor = FakeEditor::new(|path: &Path| {
                let text = fs::read_to_string(path)?
                    .replace("# Subject: Old", "# Subject: New")
                    .replace("# Completed: false", "# Completed: true");
                fs::write(path, text)?;
                Ok(ExitOutcome::Success)
            });
            let session = EditSession::new(
                &service,
                &editor,
                Editor::resolve(None),
                dir.path().to_path_buf(),
            );

            let outcome = session.run("proj", 7).expect("edit");

            let expected = Todo {
                subject: "New".into(),
                completed: true,
                ..todo_seven()
            };
            assert_eq!(outcome, EditOutcome::Updated(expected.clone()));
            assert_eq!(
                service.updates.borrow().as_slice(),
                &[("proj".to_string(), 7, expected)]
            );
            assert!(!editor.seen().exists());
            assert!(is_empty_dir(dir.path()));
        }

        #[test]
        fn editor_failure_abandons_without_submitting() {
            let dir = tempfile::tempdir().expect("tempdir");
            let service = InMemoryTodos::with(todo_seven());
            let editor = FakeEditor::new(|path: &Path| {
                fs::write(path, "# Subject: Should not land\n\n")?;
                Ok(ExitOutcome::Failed(Some(1)))
            });
            let session = EditSession::new(
                &service,
                &editor,
                Editor::resolve(Some("nano")),
                dir.path().to_path_buf(),
            );

            let outcome = session.run("proj", 7).expect("edit");

            match outcome {
                EditOutcome::Abandoned { reason } => {
                    assert!(reason.contains("nano"), "{reason}");
                    assert!(reason.contains('1'), "{reason}");
                }
                other => panic!("expected abandoned edit, got {other:?}"),
            }
            assert!(service.updates.borrow().is_empty());
            assert!(!editor.seen().exists());
            assert!(is_empty_dir(dir.path()));
        }

        #[test]
        fn launch_failure_is_an_error_and_still_cleans_up() {
            let dir = tempfile::tempdir().expect("tempdir");
            let service = InMemoryTodos::with(todo_seven());
            let editor = FakeEditor::new(|_: &Path| {
                Err(io::Error::new(io::ErrorKind::NotFound, "no such editor"))
            });
            let session = EditSession::new(
                &service,
                &editor,
                Editor::resolve(Some("missing-editor")),
                dir.path().to_path_buf(),
            );

            let err = session.run("proj", 7).unwrap_err();

            assert!(matches!(err, EditError::Launch { ref editor, .. } if editor == "missing-editor"));
            assert!(service.updates.borrow().is_empty());
            assert!(is_empty_dir(dir.path()));
        }

        #[test]
        fn submit_failure_is_reported_and_file_is_removed() {
            let dir = tempfile::tempdir().expect("tempdir");
            let mut service = InMemoryTodos::with(todo_seven());
            service.fail_updates = true;
            let editor = FakeEditor::new(|_: &Path| Ok(ExitOutcome::Success));
            let session = EditSession::new(
                &service,
                &editor,
                Editor::resolve(None),
                dir.path().to_path_buf(),
            );

            let err = session.run("proj", 7).unwrap_err();

            match err {
                EditError::Submit { ticket, source } => {
                    assert_eq!(ticket, 7);
                    assert_eq!(source.status(), Some(500));
                }
                other => panic!("expected submit error, got {other:?}"),
            }
            assert!(is_empty_dir(dir.path()));
        }

        #[test]
        fn fetch_failure_never_creates_a_file() {
            let dir = tempfile::tempdir().expect("tempdir");
            let service = InMemoryTodos::with(todo_seven());
            let editor = FakeEditor::new(|_: &Path| Ok(ExitOutcome::Success));
            let session = EditSession::new(
                &service,
                &editor,
                Editor::resolve(None),
                dir.path().to_path_buf(),
            );

            let err = session.run("proj", 99).unwrap_err();

            assert!(matches!(err, EditError::Fetch { ticket: 99, .. }));
            assert!(editor.seen.borrow().is_none());
            assert!(is_empty_dir(dir.path()));
        }

        #[test]
        fn editor_deleting_the_file_is_a_read_error() {
            let dir = tempfile::tempdir().expect("tempdir");
            let service = InMemoryTodos::with(todo_seven());
            let editor = FakeEditor::new(|path: &Path| {
                fs::remove_file(path)?;
                Ok(ExitOutcome::Success)
            });
            let session = EditSession::new(
                &service,
                &editor,
                Editor::resolve(None),
                dir.path().to_path_buf(),
            );

            let err = session.run("proj", 7).unwrap_err();

            assert!(matches!(err, EditError::Read { .. }));
            assert!(service.updates.borrow().is_empty());
        }

        #[test]
        fn editor_resolution_splits_arguments_and_defaults_to_vim() {
            assert_eq!(
                Editor::resolve(None),
                Editor {
                    program: "vim".into(),
                    args: vec![]
                }
            );
            assert_eq!(Editor::resolve(Some("   ")).program, "vim");
            let code = Editor::resolve(Some("code --wait"));
            assert_eq!(code.program, "code");
            assert_eq!(code.args, vec!["--wait".to_string()]);
            assert_eq!(code.to_string(), "code --wait");
        }
    }
}

pub mod render {
    //! Plain-text tables and detail views for terminal output.

    use crate::core::{DATE_FORMAT, Project, Todo};

    /// Left-aligned columns separated by two spaces.
    #[derive(Debug, Clone, Default)]
    pub struct Table {
        headers: Vec<String>,
        rows: Vec<Vec<String>>,
    }

    impl Table {
        pub fn new<I, S>(headers: I) -> Self
        where
            I: IntoIterator<Item = S>,
            S: Into<String>,
        {
            Self {
                headers: headers.into_iter().map(Into::into).collect(),
                rows: vec![],
            }
        }

        pub fn add_row<I, S>(&mut self, cells: I)
        where
            I: IntoIterator<Item = S>,
            S: ToString,
        {
            self.rows
                .push(cells.into_iter().map(|c| c.to_string()).collect());
        }

        pub fn render(&self) -> String {
            let columns = self
                .rows
                .iter()
                .map(Vec::len)
                .chain(std::iter::once(self.headers.len()))
                .max()
                .unwrap_or(0);
            let mut widths = vec![0usize; columns];
            for row in std::iter::once(&self.headers).chain(self.rows.iter()) {
                for (idx, cell) in row.iter().enumerate() {
                    widths[idx] = widths[idx].max(cell.chars().count());
                }
            }

            let mut out = String::new();
            for row in std::iter::once(&self.headers).chain(self.rows.iter()) {
                let line = row
                    .iter()
                    .enumerate()
                    .map(|(idx, cell)| format!("{:<width$}", cell, width = widths[idx]))
                    .collect::<Vec<_>>()
                    .join("  ");
                out.push_str(line.trim_end());
                out.push('\n');
            }
            out
        }
    }

    /// Collapse whitespace to single spaces and cut to `max` chars, ending in `...`.
    pub fn truncate(text: &str, max: usize) -> String {
        const OMISSION: &str = "...";
        let flat = text.split_whitespace().collect::<Vec<_>>().join(" ");
        if flat.chars().count() <= max {
            return flat;
        }
        let keep = max.saturating_sub(OMISSION.len());
        let mut out: String = flat.chars().take(keep).collect();
        out.push_str(OMISSION);
        out
    }

    pub fn todo_table(todos: &[Todo]) -> Table {
        let mut table = Table::new([
            "Ticket",
            "Subject",
            "Body",
            "Due Date",
            "Completed",
            "Past Due",
        ]);
        for todo in todos {
            let due = todo
                .due_date
                .map(|d| d.format(DATE_FORMAT).to_string())
                .unwrap_or_else(|| "-".to_string());
            table.add_row([
                todo.ticket.to_string(),
                truncate(&todo.subject, 24),
                truncate(&todo.body, 32),
                due,
                todo.completed.to_string(),
                todo.past_due.to_string(),
            ]);
        }
        table
    }

    pub fn project_table(projects: &[Project]) -> Table {
        let mut table = Table::new(["ID", "Name"]);
        for project in projects {
            table.add_row([project.ticket.to_string(), project.name.clone()]);
        }
        table
    }

    pub fn todo_detail(todo: &Todo) -> String {
        let mut out = format!("Ticket: {}\n", todo.ticket);
        if let Some(due) = todo.due_date {
            out.push_str(&format!("Due Date: {}\n", due.format(DATE_FORMAT)));
        }
        out.push_str(&format!("Completed: {}\n", todo.completed));
        out.push_str(&format!("Subject: {}\n", todo.subject));
        out.push('\n');
        out.push_str(&todo.body);
        out.push('\n');
        out
    }

}

pub use edit::{EditOutcome, EditSession};
pub use header::{parse_edit_text, render_edit_file};
