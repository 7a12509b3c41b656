//! In-process spatial store
//!
//! Mirrors the PostGIS contract closely enough to exercise the loader
//! without a database: the extension can be missing or uncreatable, tables
//! must exist before inserts, geometry fragments are validated the way
//! `ST_GeomFromKML` would reject them, and writes only become visible on
//! commit. Every call is recorded so tests can assert on ordering.

use async_trait::async_trait;
use geoarc_common::GeometryKind;
use std::collections::BTreeMap;
use std::sync::{Arc, Mutex, MutexGuard};

use super::{FeatureRow, LoadTransaction, SampleRow, SpatialStore, StoreError, StoreResult};

const EXTENSION_VERSION: &str = "3.4 USE_GEOS=1 USE_PROJ=1 USE_STATS=1";

/// Spatial extension availability
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExtensionState {
    Installed,
    /// Missing, but `create_spatial_extension` will install it
    Creatable,
    /// Missing and cannot be installed
    Unavailable,
}

/// A store interaction, in call order
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreCall {
    Ping,
    SpatialVersion,
    CreateExtension,
    TableExists(String),
    Begin,
    Savepoint,
    ReleaseSavepoint,
    RollbackToSavepoint,
    Insert { table: String, source_id: String },
    Commit,
    Rollback,
    CountRows(String),
    SampleRows(String),
    Analyze(String),
    Close,
}

/// Parsed geometry held by the memory store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredGeometry {
    pub kind: GeometryKind,
    pub positions: Vec<Vec<f64>>,
}

impl StoredGeometry {
    /// Parse a KML fragment as produced by the loader
    pub fn from_kml(fragment: &str) -> StoreResult<Self> {
        let fragment = fragment.trim();
        let kind = GeometryKind::ALL
            .into_iter()
            .find(|kind| fragment.starts_with(&format!("<{}>", kind.element_name())))
            .ok_or_else(|| {
                StoreError::Rejected(format!("unsupported KML geometry: {}", preview(fragment)))
            })?;

        let text = between(fragment, "<coordinates>", "</coordinates>").ok_or_else(|| {
            StoreError::Rejected("KML geometry has no coordinates element".to_string())
        })?;

        let positions = text
            .split_whitespace()
            .map(parse_position)
            .collect::<StoreResult<Vec<_>>>()?;

        let minimum = match kind {
            GeometryKind::Point => 1,
            GeometryKind::LineString => 2,
            GeometryKind::Polygon => 4,
        };
        if positions.len() < minimum {
            return Err(StoreError::Rejected(format!(
                "{} requires at least {} positions, got {}",
                kind,
                minimum,
                positions.len()
            )));
        }
        if kind == GeometryKind::Polygon && positions.first() != positions.last() {
            return Err(StoreError::Rejected(
                "geometry contains non-closed rings".to_string(),
            ));
        }

        Ok(Self { kind, positions })
    }

    /// Render as WKT using the first two ordinates of each position
    pub fn to_wkt(&self) -> String {
        let coords = self
            .positions
            .iter()
            .map(|p| format!("{} {}", p[0], p[1]))
            .collect::<Vec<_>>()
            .join(",");

        match self.kind {
            GeometryKind::Point => format!("POINT({})", coords),
            GeometryKind::LineString => format!("LINESTRING({})", coords),
            GeometryKind::Polygon => format!("POLYGON(({}))", coords),
        }
    }
}

fn between<'a>(text: &'a str, open: &str, close: &str) -> Option<&'a str> {
    let start = text.find(open)? + open.len();
    let end = text[start..].find(close)? + start;
    Some(&text[start..end])
}

fn preview(text: &str) -> String {
    text.chars().take(40).collect()
}

fn parse_position(tuple: &str) -> StoreResult<Vec<f64>> {
    let ordinates = tuple
        .split(',')
        .map(|value| {
            value.trim().parse::<f64>().map_err(|_| {
                StoreError::Rejected(format!("invalid KML coordinate tuple '{}'", tuple))
            })
        })
        .collect::<StoreResult<Vec<_>>>()?;

    if !(2..=3).contains(&ordinates.len()) {
        return Err(StoreError::Rejected(format!(
            "KML coordinate tuple '{}' must have 2 or 3 ordinates",
            tuple
        )));
    }
    Ok(ordinates)
}

/// A row committed to the memory store
#[derive(Debug, Clone, PartialEq)]
pub struct StoredFeature {
    pub id: i64,
    pub source_id: String,
    pub name: Option<String>,
    pub description: Option<String>,
    pub metadata: serde_json::Value,
    /// Geometry markup exactly as it was handed to the store
    pub kml_fragment: String,
    pub geometry: StoredGeometry,
}

#[derive(Debug)]
struct MemoryState {
    extension: ExtensionState,
    tables: BTreeMap<String, Vec<StoredFeature>>,
    next_id: i64,
    calls: Vec<StoreCall>,
    closed: bool,
}

/// Shared, cloneable in-memory store
#[derive(Debug, Clone)]
pub struct MemoryStore {
    state: Arc<Mutex<MemoryState>>,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new(ExtensionState::Installed)
    }
}

impl MemoryStore {
    /// Empty store without any tables
    pub fn new(extension: ExtensionState) -> Self {
        Self {
            state: Arc::new(Mutex::new(MemoryState {
                extension,
                tables: BTreeMap::new(),
                next_id: 1,
                calls: Vec::new(),
                closed: false,
            })),
        }
    }

    /// Store with the extension installed and `table` created
    pub fn with_table(table: &str) -> Self {
        let store = Self::default();
        store.create_table(table);
        store
    }

    pub fn create_table(&self, table: &str) {
        self.lock().tables.entry(table.to_string()).or_default();
    }

    /// Committed rows of `table`, in insertion order
    pub fn rows(&self, table: &str) -> Vec<StoredFeature> {
        self.lock().tables.get(table).cloned().unwrap_or_default()
    }

    pub fn extension(&self) -> ExtensionState {
        self.lock().extension
    }

    /// Every call made so far
    pub fn calls(&self) -> Vec<StoreCall> {
        self.lock().calls.clone()
    }

    fn lock(&self) -> MutexGuard<'_, MemoryState> {
        self.state.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    fn record(&self, call: StoreCall) -> MutexGuard<'_, MemoryState> {
        let mut state = self.lock();
        state.calls.push(call);
        state
    }
}

fn ensure_open(state: &MemoryState) -> StoreResult<()> {
    if state.closed {
        return Err(StoreError::Rejected("store is closed".to_string()));
    }
    Ok(())
}

fn table_rows<'a>(state: &'a MemoryState, table: &str) -> StoreResult<&'a Vec<StoredFeature>> {
    state
        .tables
        .get(table)
        .ok_or_else(|| StoreError::Rejected(format!("relation \"{}\" does not exist", table)))
}

#[async_trait]
impl SpatialStore for MemoryStore {
    async fn ping(&self) -> StoreResult<()> {
        let state = self.record(StoreCall::Ping);
        ensure_open(&state)
    }

    async fn spatial_version(&self) -> StoreResult<String> {
        let state = self.record(StoreCall::SpatialVersion);
        ensure_open(&state)?;
        match state.extension {
            ExtensionState::Installed => Ok(EXTENSION_VERSION.to_string()),
            _ => Err(StoreError::Rejected(
                "function postgis_version() does not exist".to_string(),
            )),
        }
    }

    async fn create_spatial_extension(&self) -> StoreResult<()> {
        let mut state = self.record(StoreCall::CreateExtension);
        ensure_open(&state)?;
        match state.extension {
            ExtensionState::Installed => Ok(()),
            ExtensionState::Creatable => {
                state.extension = ExtensionState::Installed;
                Ok(())
            },
            ExtensionState::Unavailable => Err(StoreError::Rejected(
                "extension \"postgis\" is not available".to_string(),
            )),
        }
    }

    async fn table_exists(&self, table: &str) -> StoreResult<bool> {
        let state = self.record(StoreCall::TableExists(table.to_string()));
        ensure_open(&state)?;
        Ok(state.tables.contains_key(table))
    }

    async fn begin(&self) -> StoreResult<Box<dyn LoadTransaction>> {
        {
            let state = self.record(StoreCall::Begin);
            ensure_open(&state)?;
        }
        Ok(Box::new(MemoryTransaction {
            store: self.clone(),
            pending: Vec::new(),
            savepoint: None,
            finished: false,
        }))
    }

    async fn count_rows(&self, table: &str) -> StoreResult<i64> {
        let state = self.record(StoreCall::CountRows(table.to_string()));
        ensure_open(&state)?;
        Ok(table_rows(&state, table)?.len() as i64)
    }

    async fn sample_rows(&self, table: &str, limit: i64) -> StoreResult<Vec<SampleRow>> {
        let state = self.record(StoreCall::SampleRows(table.to_string()));
        ensure_open(&state)?;
        let limit = usize::try_from(limit).unwrap_or(0);
        Ok(table_rows(&state, table)?
            .iter()
            .take(limit)
            .map(|row| SampleRow {
                id: row.id,
                source_id: row.source_id.clone(),
                name: row.name.clone(),
                wkt: Some(row.geometry.to_wkt()),
            })
            .collect())
    }

    async fn analyze(&self, table: &str) -> StoreResult<()> {
        let state = self.record(StoreCall::Analyze(table.to_string()));
        ensure_open(&state)?;
        table_rows(&state, table).map(|_| ())
    }

    async fn close(&self) {
        let mut state = self.record(StoreCall::Close);
        state.closed = true;
    }
}

struct MemoryTransaction {
    store: MemoryStore,
    pending: Vec<(String, StoredFeature)>,
    /// Pending length when the savepoint was taken
    savepoint: Option<usize>,
    finished: bool,
}

impl MemoryTransaction {
    fn ensure_active(&self) -> StoreResult<()> {
        if self.finished {
            return Err(StoreError::TransactionFinished);
        }
        Ok(())
    }
}

#[async_trait]
impl LoadTransaction for MemoryTransaction {
    async fn savepoint(&mut self) -> StoreResult<()> {
        self.store.record(StoreCall::Savepoint);
        self.ensure_active()?;
        self.savepoint = Some(self.pending.len());
        Ok(())
    }

    async fn release_savepoint(&mut self) -> StoreResult<()> {
        self.store.record(StoreCall::ReleaseSavepoint);
        self.ensure_active()?;
        self.savepoint
            .take()
            .map(|_| ())
            .ok_or_else(|| StoreError::Rejected("savepoint does not exist".to_string()))
    }

    async fn rollback_to_savepoint(&mut self) -> StoreResult<()> {
        self.store.record(StoreCall::RollbackToSavepoint);
        self.ensure_active()?;
        let mark = self
            .savepoint
            .ok_or_else(|| StoreError::Rejected("savepoint does not exist".to_string()))?;
        self.pending.truncate(mark);
        Ok(())
    }

    async fn insert_feature(&mut self, table: &str, row: &FeatureRow<'_>) -> StoreResult<i64> {
        let mut state = self.store.record(StoreCall::Insert {
            table: table.to_string(),
            source_id: row.source_id.to_string(),
        });
        self.ensure_active()?;
        ensure_open(&state)?;
        table_rows(&state, table)?;

        let geometry = StoredGeometry::from_kml(&row.kml_fragment)?;

        // Identifiers are consumed even if the row is later rolled back
        let id = state.next_id;
        state.next_id += 1;

        self.pending.push((
            table.to_string(),
            StoredFeature {
                id,
                source_id: row.source_id.to_string(),
                name: row.name.map(str::to_string),
                description: row.description.map(str::to_string),
                metadata: row.metadata.clone(),
                kml_fragment: row.kml_fragment.to_string(),
                geometry,
            },
        ));
        Ok(id)
    }

    async fn commit(&mut self) -> StoreResult<()> {
        let mut state = self.store.record(StoreCall::Commit);
        self.ensure_active()?;
        self.finished = true;
        for (table, feature) in self.pending.drain(..) {
            state.tables.entry(table).or_default().push(feature);
        }
        Ok(())
    }

    async fn rollback(&mut self) -> StoreResult<()> {
        self.store.record(StoreCall::Rollback);
        self.ensure_active()?;
        self.finished = true;
        self.pending.clear();
        Ok(())
    }
}
