//! Migration model: one versioned migration and the capability to plan a step.

use once_cell::sync::OnceCell;
use std::fmt;
use std::fs::File;
use std::future::Future;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use crate::definitions::Direction;
use crate::error::{EngineError, EngineResult};
use crate::ledger::Executor;
use crate::parser::{ParsedScript, ScriptParser};
use crate::version::parse_version;

/// Future returned by a code migration
pub type MigrationFuture<'a> = Pin<Box<dyn Future<Output = EngineResult<()>> + Send + 'a>>;

/// A code migration body. It receives the executor of the current transaction
/// (safe mode) or connection (non-transactional mode).
pub type MigrationFn = Arc<dyn for<'a> Fn(&'a mut dyn Executor) -> MigrationFuture<'a> + Send + Sync>;

/// Wrap a function returning a boxed future into a [`MigrationFn`].
///
/// ```ignore
/// let up = migration_fn(|db| Box::pin(async move {
///     db.execute("CREATE TABLE accounts (id serial PRIMARY KEY)").await?;
///     Ok(())
/// }));
/// ```
pub fn migration_fn<F>(f: F) -> MigrationFn
where
    F: for<'a> Fn(&'a mut dyn Executor) -> MigrationFuture<'a> + Send + Sync + 'static,
{
    Arc::new(f)
}

/// Where a migration came from
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MigrationSource {
    /// A file in the migrations directory
    File(PathBuf),
    /// Registered in code with the migration registry
    Registered,
}

impl fmt::Display for MigrationSource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MigrationSource::File(path) => write!(f, "{}", path.display()),
            MigrationSource::Registered => f.write_str("<registered>"),
        }
    }
}

/// SQL script migration, parsed on first use per direction
#[derive(Debug, Clone)]
pub struct ScriptMigration {
    path: PathBuf,
    parser: ScriptParser,
    up: OnceCell<ParsedScript>,
    down: OnceCell<ParsedScript>,
}

impl ScriptMigration {
    pub fn new(path: impl Into<PathBuf>, parser: ScriptParser) -> Self {
        Self {
            path: path.into(),
            parser,
            up: OnceCell::new(),
            down: OnceCell::new(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Parsed statements for `direction`; the file is read once per direction.
    pub fn parsed(&self, direction: Direction) -> EngineResult<&ParsedScript> {
        let cell = match direction {
            Direction::Up => &self.up,
            Direction::Down => &self.down,
        };
        cell.get_or_try_init(|| {
            let file = File::open(&self.path)?;
            self.parser
                .parse(BufReader::new(file), direction)
                .map_err(|source| EngineError::Parse {
                    path: self.path.clone(),
                    source,
                })
        })
    }
}

/// Migration implemented as Rust code
#[derive(Clone)]
pub struct CodeMigration {
    pub up: Option<MigrationFn>,
    pub down: Option<MigrationFn>,
    pub transactional: bool,
}

impl fmt::Debug for CodeMigration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CodeMigration")
            .field("up", &self.up.is_some())
            .field("down", &self.down.is_some())
            .field("transactional", &self.transactional)
            .finish()
    }
}

/// How a migration's body is provided
#[derive(Debug, Clone)]
pub enum MigrationKind {
    Script(ScriptMigration),
    Code(CodeMigration),
    /// A code migration file found on disk with no matching registration
    Unregistered,
}

/// The body to run for one step
#[derive(Clone)]
pub enum StepAction {
    Statements(Vec<String>),
    Function(MigrationFn),
    /// Nothing to run; the ledger is still updated
    Empty,
}

impl fmt::Debug for StepAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            StepAction::Statements(statements) => {
                f.debug_tuple("Statements").field(&statements.len()).finish()
            }
            StepAction::Function(_) => f.write_str("Function"),
            StepAction::Empty => f.write_str("Empty"),
        }
    }
}

impl StepAction {
    /// Run the body against `executor`
    pub async fn run(&self, executor: &mut dyn Executor) -> EngineResult<()> {
        match self {
            StepAction::Statements(statements) => {
                for statement in statements {
                    executor.execute(statement).await?;
                }
                Ok(())
            }
            StepAction::Function(f) => f(executor).await,
            StepAction::Empty => Ok(()),
        }
    }
}

/// Execution plan for one migration in one direction
#[derive(Debug, Clone)]
pub struct StepPlan {
    pub transactional: bool,
    pub action: StepAction,
}

/// Represents a single migration
#[derive(Debug, Clone)]
pub struct Migration {
    pub version: String,
    pub key: u64,
    pub source: MigrationSource,
    pub kind: MigrationKind,
    /// True when contributed by code registered at startup
    pub registered: bool,
    pub previous: Option<u64>,
    pub next: Option<u64>,
}

impl Migration {
    /// Script migration backed by a `.sql` file
    pub fn script(version: &str, path: impl Into<PathBuf>, parser: ScriptParser) -> EngineResult<Self> {
        let path = path.into();
        Ok(Self::build(
            version,
            parse_version(version)?,
            MigrationSource::File(path.clone()),
            MigrationKind::Script(ScriptMigration::new(path, parser)),
            false,
        ))
    }

    /// Code migration registered with the registry
    pub fn code(version: &str, migration: CodeMigration) -> EngineResult<Self> {
        Ok(Self::build(
            version,
            parse_version(version)?,
            MigrationSource::Registered,
            MigrationKind::Code(migration),
            true,
        ))
    }

    /// Code migration file that nothing registered
    pub fn unregistered(version: &str, path: impl Into<PathBuf>) -> EngineResult<Self> {
        Ok(Self::build(
            version,
            parse_version(version)?,
            MigrationSource::File(path.into()),
            MigrationKind::Unregistered,
            false,
        ))
    }

    fn build(
        version: &str,
        key: u64,
        source: MigrationSource,
        kind: MigrationKind,
        registered: bool,
    ) -> Self {
        Self {
            version: version.to_string(),
            key,
            source,
            kind,
            registered,
            previous: None,
            next: None,
        }
    }

    /// Resolve what running this migration in `direction` means.
    ///
    /// Scripts are parsed here on first use, so calling this for every migration in
    /// a batch validates the whole batch before anything touches the database.
    pub fn plan(&self, direction: Direction) -> EngineResult<StepPlan> {
        match &self.kind {
            MigrationKind::Script(script) => {
                let parsed = script.parsed(direction)?;
                let action = if parsed.statements.is_empty() {
                    StepAction::Empty
                } else {
                    StepAction::Statements(parsed.statements.clone())
                };
                Ok(StepPlan {
                    transactional: parsed.transactional,
                    action,
                })
            }
            MigrationKind::Code(code) => {
                let f = match direction {
                    Direction::Up => &code.up,
                    Direction::Down => &code.down,
                };
                Ok(StepPlan {
                    transactional: code.transactional,
                    action: f.clone().map_or(StepAction::Empty, StepAction::Function),
                })
            }
            MigrationKind::Unregistered => Err(EngineError::UnregisteredMigration {
                version: self.version.clone(),
            }),
        }
    }

    /// File name or registration marker, for log lines
    pub fn display_source(&self) -> String {
        match &self.source {
            MigrationSource::File(path) => path
                .file_name()
                .map(|name| name.to_string_lossy().into_owned())
                .unwrap_or_else(|| self.version.clone()),
            MigrationSource::Registered => self.version.clone(),
        }
    }
}

impl fmt::Display for Migration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.version)
    }
}
