//! Parser Adapter (spec.md §4.6 step 6, §1 Non-goals): an opaque scan of a
//! cloned tree into a typed inventory. The real parser library is an
//! external collaborator; this module only defines the boundary and a
//! test-only stub so the pipeline above it is independently testable.

use async_trait::async_trait;
use storage::{CaseStatus, NewCase, NewSuite};

/// One file's parsed inventory, already shaped for
/// [`storage::TestTreeRepository::persist_inventory`]'s two-pass insert.
pub struct ParsedFile {
    pub path: String,
    pub framework: String,
    pub imports: Vec<String>,
    pub calls: Vec<String>,
    pub suites: Vec<NewSuite>,
    pub cases: Vec<NewCase>,
}

pub struct Inventory {
    pub files: Vec<ParsedFile>,
}

impl Inventory {
    pub fn total_suites(&self) -> i32 {
        self.files.iter().map(|f| f.suites.len() as i32).sum()
    }

    pub fn total_tests(&self) -> i32 {
        self.files.iter().map(|f| f.cases.len() as i32).sum()
    }
}

#[async_trait]
pub trait ParserAdapter: Send + Sync {
    /// `worker_version` is this binary's linked parser-library version
    /// (SPEC_FULL.md §11, "`parser_version` capture at worker startup"),
    /// threaded through so the Analyze Pipeline can stamp it on the
    /// `Analysis` row without the parser crate needing to know about storage.
    async fn scan(&self, source_path: &std::path::Path) -> anyhow::Result<Inventory>;

    fn version(&self) -> &str;
}

/// A stub used by the worker crate's own tests and by binaries that don't
/// link the real parser library. Returns a single synthetic file so pipeline
/// tests can exercise the persistence path without a real repository.
pub struct StubParser {
    version: &'static str,
}

impl StubParser {
    pub fn new(version: &'static str) -> Self {
        Self { version }
    }
}

#[async_trait]
impl ParserAdapter for StubParser {
    async fn scan(&self, _source_path: &std::path::Path) -> anyhow::Result<Inventory> {
        let suite = NewSuite {
            local_id: 0,
            parent_local_id: None,
            file_id: uuid::Uuid::nil(),
            name: "stub suite".to_string(),
            sort_order: 0,
        };
        let case = NewCase {
            suite_local_id: 0,
            name: "stub case".to_string(),
            status: CaseStatus::Active,
            modifier: None,
            sort_order: 0,
        };
        Ok(Inventory {
            files: vec![ParsedFile {
                path: "stub.test.ts".to_string(),
                framework: "stub".to_string(),
                imports: vec![],
                calls: vec![],
                suites: vec![suite],
                cases: vec![case],
            }],
        })
    }

    fn version(&self) -> &str {
        self.version
    }
}
