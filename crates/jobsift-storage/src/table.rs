//! Tabular job store: one tab per day, columns addressed by header name.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use jobsift_core::{columns, Cells, JobStatus, RowRef};
use tokio::fs;
use tokio::sync::Mutex;
use tracing::debug;

use crate::{write_atomic, StoreError};

/// Which rows [`TableStore::get_all`] returns.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RowFilter {
    pub tab: Option<String>,
    pub status: Option<JobStatus>,
}

impl RowFilter {
    pub fn all() -> Self {
        Self::default()
    }

    pub fn tab(tab: impl Into<String>) -> Self {
        Self {
            tab: Some(tab.into()),
            status: None,
        }
    }

    pub fn with_status(mut self, status: JobStatus) -> Self {
        self.status = Some(status);
        self
    }

    fn matches(&self, tab: &str, cells: &Cells) -> bool {
        if self.tab.as_deref().is_some_and(|t| t != tab) {
            return false;
        }
        match self.status {
            Some(status) => cells
                .get(columns::STATUS)
                .and_then(|s| JobStatus::parse(s))
                .unwrap_or(JobStatus::New)
                == status,
            None => true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredRow {
    pub row: RowRef,
    pub cells: Cells,
}

/// Partial write of named columns into one existing row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RowUpdate {
    pub row: RowRef,
    pub cells: Cells,
}

/// Store adapter consumed by the pipeline. Implementations must serialize their own writes.
#[async_trait]
pub trait TableStore: Send + Sync {
    /// Tab names, newest first.
    async fn tabs(&self) -> Result<Vec<String>, StoreError>;

    async fn headers(&self, tab: &str) -> Result<Vec<String>, StoreError>;

    /// Append rows to `tab`, creating the tab and any unknown columns on demand.
    async fn append(&self, tab: &str, rows: &[Cells]) -> Result<Vec<RowRef>, StoreError>;

    /// Rows across tabs (newest tab first, then row order) matching `filter`.
    async fn get_all(&self, filter: &RowFilter) -> Result<Vec<StoredRow>, StoreError>;

    /// Write named cells into existing rows. Columns are appended to the header if absent.
    async fn update(&self, updates: &[RowUpdate]) -> Result<(), StoreError>;

    /// Replace every data row of `tab` with `rows`, in order. The header row is kept.
    async fn rewrite_sorted(&self, tab: &str, rows: &[Cells]) -> Result<(), StoreError>;
}

#[derive(Debug, Clone, Default)]
struct TabData {
    headers: Vec<String>,
    rows: Vec<Vec<String>>,
}

impl TabData {
    fn fresh() -> Self {
        Self {
            headers: columns::BASE.iter().map(ToString::to_string).collect(),
            rows: Vec::new(),
        }
    }

    fn column_index(&mut self, header: &str) -> usize {
        if let Some(index) = self.headers.iter().position(|h| h == header) {
            return index;
        }
        // Legacy sheets spell the applied column without a space.
        if columns::is_applied_header(header) {
            if let Some(index) = self
                .headers
                .iter()
                .position(|h| columns::is_applied_header(h))
            {
                return index;
            }
        }
        self.headers.push(header.to_string());
        for row in &mut self.rows {
            row.push(String::new());
        }
        self.headers.len() - 1
    }

    fn write_cells(&mut self, index: usize, cells: &Cells) {
        for (header, value) in cells {
            let column = self.column_index(header);
            let row = &mut self.rows[index];
            if row.len() <= column {
                row.resize(column + 1, String::new());
            }
            row[column] = value.clone();
        }
    }

    fn push(&mut self, cells: &Cells) -> usize {
        self.rows.push(vec![String::new(); self.headers.len()]);
        let index = self.rows.len() - 1;
        self.write_cells(index, cells);
        index
    }

    fn cells(&self, index: usize) -> Cells {
        let row = &self.rows[index];
        self.headers
            .iter()
            .enumerate()
            .map(|(i, h)| (h.clone(), row.get(i).cloned().unwrap_or_default()))
            .collect()
    }

    fn collect(&self, tab: &str, filter: &RowFilter, out: &mut Vec<StoredRow>) {
        for index in 0..self.rows.len() {
            let cells = self.cells(index);
            if filter.matches(tab, &cells) {
                out.push(StoredRow {
                    row: RowRef {
                        tab: tab.to_string(),
                        index,
                    },
                    cells,
                });
            }
        }
    }

    fn apply_update(&mut self, update: &RowUpdate) -> Result<(), StoreError> {
        if update.row.index >= self.rows.len() {
            return Err(StoreError::RowNotFound {
                tab: update.row.tab.clone(),
                index: update.row.index,
            });
        }
        self.write_cells(update.row.index, &update.cells);
        Ok(())
    }

    fn replace_rows(&mut self, rows: &[Cells]) {
        self.rows.clear();
        for cells in rows {
            self.push(cells);
        }
    }
}

fn group_updates(updates: &[RowUpdate]) -> BTreeMap<&str, Vec<&RowUpdate>> {
    let mut grouped: BTreeMap<&str, Vec<&RowUpdate>> = BTreeMap::new();
    for update in updates {
        grouped.entry(update.row.tab.as_str()).or_default().push(update);
    }
    grouped
}

/// CSV-backed store: one `<tab>.csv` file per tab under `root`, each rewritten atomically.
#[derive(Debug)]
pub struct CsvTableStore {
    root: PathBuf,
    write_lock: Mutex<()>,
}

impl CsvTableStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            write_lock: Mutex::new(()),
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn tab_path(&self, tab: &str) -> PathBuf {
        self.root.join(format!("{tab}.csv"))
    }

    async fn read_tab(&self, tab: &str) -> Result<Option<TabData>, StoreError> {
        let path = self.tab_path(tab);
        let bytes = match fs::read(&path).await {
            Ok(bytes) => bytes,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(err) => return Err(StoreError::io(&path, err)),
        };

        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_reader(bytes.as_slice());
        let headers = reader
            .headers()
            .map_err(|source| StoreError::Csv {
                path: path.clone(),
                source,
            })?
            .iter()
            .map(|h| h.trim().to_string())
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for record in reader.records() {
            let record = record.map_err(|source| StoreError::Csv {
                path: path.clone(),
                source,
            })?;
            let mut row = record.iter().map(ToString::to_string).collect::<Vec<_>>();
            row.resize(headers.len(), String::new());
            rows.push(row);
        }
        Ok(Some(TabData { headers, rows }))
    }

    async fn write_tab(&self, tab: &str, data: &TabData) -> Result<(), StoreError> {
        let path = self.tab_path(tab);
        let mut writer = csv::Writer::from_writer(Vec::new());
        let csv_err = |source| StoreError::Csv {
            path: path.clone(),
            source,
        };
        writer.write_record(&data.headers).map_err(csv_err)?;
        for row in &data.rows {
            writer.write_record(row).map_err(csv_err)?;
        }
        let bytes = writer
            .into_inner()
            .map_err(|e| StoreError::io(&path, e.into_error()))?;
        write_atomic(&path, &bytes).await?;
        debug!(tab, rows = data.rows.len(), "tab written");
        Ok(())
    }
}

#[async_trait]
impl TableStore for CsvTableStore {
    async fn tabs(&self) -> Result<Vec<String>, StoreError> {
        let mut entries = match fs::read_dir(&self.root).await {
            Ok(entries) => entries,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(err) => return Err(StoreError::io(&self.root, err)),
        };

        let mut tabs = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(&self.root, e))?
        {
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') {
                continue;
            }
            if let Some(tab) = name.strip_suffix(".csv") {
                tabs.push(tab.to_string());
            }
        }
        tabs.sort_by(|a, b| b.cmp(a));
        Ok(tabs)
    }

    async fn headers(&self, tab: &str) -> Result<Vec<String>, StoreError> {
        self.read_tab(tab)
            .await?
            .map(|data| data.headers)
            .ok_or_else(|| StoreError::TabNotFound(tab.to_string()))
    }

    async fn append(&self, tab: &str, rows: &[Cells]) -> Result<Vec<RowRef>, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self.read_tab(tab).await?.unwrap_or_else(TabData::fresh);
        let refs = rows
            .iter()
            .map(|cells| RowRef {
                tab: tab.to_string(),
                index: data.push(cells),
            })
            .collect::<Vec<_>>();
        self.write_tab(tab, &data).await?;
        Ok(refs)
    }

    async fn get_all(&self, filter: &RowFilter) -> Result<Vec<StoredRow>, StoreError> {
        let tabs = match &filter.tab {
            Some(tab) => vec![tab.clone()],
            None => self.tabs().await?,
        };
        let mut out = Vec::new();
        for tab in tabs {
            if let Some(data) = self.read_tab(&tab).await? {
                data.collect(&tab, filter, &mut out);
            }
        }
        Ok(out)
    }

    async fn update(&self, updates: &[RowUpdate]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        for (tab, updates) in group_updates(updates) {
            let mut data = self
                .read_tab(tab)
                .await?
                .ok_or_else(|| StoreError::TabNotFound(tab.to_string()))?;
            for update in updates {
                data.apply_update(update)?;
            }
            self.write_tab(tab, &data).await?;
        }
        Ok(())
    }

    async fn rewrite_sorted(&self, tab: &str, rows: &[Cells]) -> Result<(), StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut data = self
            .read_tab(tab)
            .await?
            .ok_or_else(|| StoreError::TabNotFound(tab.to_string()))?;
        data.replace_rows(rows);
        self.write_tab(tab, &data).await
    }
}

/// In-process store used by tests and dry runs.
#[derive(Debug, Default)]
pub struct MemoryTableStore {
    tabs: Mutex<BTreeMap<String, TabData>>,
}

impl MemoryTableStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl TableStore for MemoryTableStore {
    async fn tabs(&self) -> Result<Vec<String>, StoreError> {
        Ok(self.tabs.lock().await.keys().rev().cloned().collect())
    }

    async fn headers(&self, tab: &str) -> Result<Vec<String>, StoreError> {
        self.tabs
            .lock()
            .await
            .get(tab)
            .map(|data| data.headers.clone())
            .ok_or_else(|| StoreError::TabNotFound(tab.to_string()))
    }

    async fn append(&self, tab: &str, rows: &[Cells]) -> Result<Vec<RowRef>, StoreError> {
        let mut tabs = self.tabs.lock().await;
        let data = tabs.entry(tab.to_string()).or_insert_with(TabData::fresh);
        Ok(rows
            .iter()
            .map(|cells| RowRef {
                tab: tab.to_string(),
                index: data.push(cells),
            })
            .collect())
    }

    async fn get_all(&self, filter: &RowFilter) -> Result<Vec<StoredRow>, StoreError> {
        let tabs = self.tabs.lock().await;
        let mut out = Vec::new();
        for (tab, data) in tabs.iter().rev() {
            data.collect(tab, filter, &mut out);
        }
        Ok(out)
    }

    async fn update(&self, updates: &[RowUpdate]) -> Result<(), StoreError> {
        let mut tabs = self.tabs.lock().await;
        for update in updates {
            tabs.get_mut(&update.row.tab)
                .ok_or_else(|| StoreError::TabNotFound(update.row.tab.clone()))?
                .apply_update(update)?;
        }
        Ok(())
    }

    async fn rewrite_sorted(&self, tab: &str, rows: &[Cells]) -> Result<(), StoreError> {
        let mut tabs = self.tabs.lock().await;
        tabs.get_mut(tab)
            .ok_or_else(|| StoreError::TabNotFound(tab.to_string()))?
            .replace_rows(rows);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn row(status: &str, link: &str) -> Cells {
        let mut cells = Cells::new();
        cells.insert(columns::STATUS.into(), status.into());
        cells.insert(columns::JOB_LINK.into(), link.into());
        cells
    }

    #[tokio::test]
    async fn csv_store_creates_tabs_and_columns_on_demand() {
        let dir = tempdir().expect("tempdir");
        let store = CsvTableStore::new(dir.path());

        let refs = store
            .append("2026-03-01", &[row("NEW", "https://x.com/1"), row("NEW", "https://x.com/2")])
            .await
            .expect("append");
        assert_eq!(refs[1].index, 1);
        assert_eq!(
            store.headers("2026-03-01").await.unwrap(),
            columns::BASE.iter().map(ToString::to_string).collect::<Vec<_>>()
        );

        let mut cells = Cells::new();
        cells.insert(columns::STATUS.into(), "EVALUATED".into());
        cells.insert(columns::REASONING.into(), "fits, mostly".into());
        store
            .update(&[RowUpdate {
                row: refs[0].clone(),
                cells,
            }])
            .await
            .expect("update");

        let headers = store.headers("2026-03-01").await.unwrap();
        assert_eq!(headers.last().map(String::as_str), Some(columns::REASONING));

        let evaluated = store
            .get_all(&RowFilter::all().with_status(JobStatus::Evaluated))
            .await
            .unwrap();
        assert_eq!(evaluated.len(), 1);
        assert_eq!(evaluated[0].cells[columns::REASONING], "fits, mostly");
        assert_eq!(evaluated[0].cells[columns::JOB_LINK], "https://x.com/1");
    }

    #[tokio::test]
    async fn csv_tabs_are_listed_newest_first() {
        let dir = tempdir().expect("tempdir");
        let store = CsvTableStore::new(dir.path());
        for tab in ["2026-02-27", "2026-03-01", "2026-02-28"] {
            store.append(tab, &[row("NEW", tab)]).await.unwrap();
        }
        assert_eq!(
            store.tabs().await.unwrap(),
            vec!["2026-03-01", "2026-02-28", "2026-02-27"]
        );
        let all = store.get_all(&RowFilter::all()).await.unwrap();
        assert_eq!(all[0].row.tab, "2026-03-01");
    }

    #[tokio::test]
    async fn rewrite_keeps_header_and_replaces_rows() {
        let store = MemoryTableStore::new();
        store
            .append("t", &[row("NEW", "a"), row("NEW", "b")])
            .await
            .unwrap();
        store
            .rewrite_sorted("t", &[row("EVALUATED", "b"), row("EVALUATED", "a")])
            .await
            .unwrap();
        let rows = store.get_all(&RowFilter::tab("t")).await.unwrap();
        let links = rows
            .iter()
            .map(|r| r.cells[columns::JOB_LINK].as_str())
            .collect::<Vec<_>>();
        assert_eq!(links, vec!["b", "a"]);
    }

    #[tokio::test]
    async fn updating_missing_rows_is_an_error() {
        let store = MemoryTableStore::new();
        store.append("t", &[row("NEW", "a")]).await.unwrap();
        let err = store
            .update(&[RowUpdate {
                row: RowRef {
                    tab: "t".into(),
                    index: 5,
                },
                cells: Cells::new(),
            }])
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::RowNotFound { index: 5, .. }));
    }
}
