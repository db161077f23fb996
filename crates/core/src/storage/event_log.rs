use super::{check_append, StateStore};
use crate::error::PersistenceError;
use crate::events::Event;
use crate::types::InstanceId;
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use flate2::write::GzEncoder;
use flate2::Compression;
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncSeekExt, AsyncWriteExt};
use tokio::sync::Mutex;

/// State store writing one JSON Lines file per instance
///
/// Live logs are plain `instances/<id>.jsonl` files, appended and fsynced per
/// transition. Once an instance is terminal its log can be archived to
/// `archive/YYYY/MM/DD/<id>.jsonl.gz`; archived logs stay readable but accept
/// no further appends.
pub struct JsonlEventLog {
    base_path: PathBuf,
    // Event ids per instance, loaded on first append; also serializes appends
    known: Mutex<HashMap<InstanceId, Vec<String>>>,
}

impl JsonlEventLog {
    pub fn new(base_path: PathBuf) -> Result<Self> {
        std::fs::create_dir_all(base_path.join("instances"))
            .context("Failed to create event log directory")?;
        Ok(Self {
            base_path,
            known: Mutex::new(HashMap::new()),
        })
    }

    fn live_path(&self, instance_id: &InstanceId) -> PathBuf {
        self.base_path
            .join("instances")
            .join(format!("{}.jsonl", instance_id))
    }

    /// Format: archive/YYYY/MM/DD/<instance_id>.jsonl.gz
    fn archive_path(&self, instance_id: &InstanceId, date: &DateTime<Utc>) -> PathBuf {
        self.base_path
            .join("archive")
            .join(format!("{:04}", date.year()))
            .join(format!("{:02}", date.month()))
            .join(format!("{:02}", date.day()))
            .join(format!("{}.jsonl.gz", instance_id))
    }

    /// Compress the log of an instance into the archive, dated by its last
    /// transition, and remove the live file
    pub async fn archive_log(&self, instance_id: InstanceId) -> Result<PathBuf> {
        let mut known = self.known.lock().await;

        let live = self.live_path(&instance_id);
        let events = read_jsonl(&live).await?;
        let last = events
            .last()
            .ok_or_else(|| anyhow::anyhow!("Instance {} has no live log", instance_id))?;

        let path = self.archive_path(&instance_id, &last.timestamp);
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .context("Failed to create archive directory")?;
        }
        write_jsonl_gz(&path, &events).await?;

        tokio::fs::remove_file(&live)
            .await
            .context("Failed to remove live event log")?;
        known.remove(&instance_id);

        tracing::info!("Archived event log of instance {} to {}", instance_id, path.display());
        Ok(path)
    }

    /// Find the archived log of an instance
    async fn find_archive(&self, instance_id: &InstanceId) -> Result<Option<PathBuf>> {
        let filename = format!("{}.jsonl.gz", instance_id);
        Ok(self
            .archived_files()?
            .into_iter()
            .find(|path| path.file_name().is_some_and(|name| name == filename.as_str())))
    }

    /// All archived log files
    fn archived_files(&self) -> Result<Vec<PathBuf>> {
        let archive_dir = self.base_path.join("archive");
        if !archive_dir.exists() {
            return Ok(Vec::new());
        }

        let mut files = Vec::new();

        // Walk through year/month/day directories
        for year_entry in std::fs::read_dir(&archive_dir).context("Failed to read archive directory")? {
            let year_entry = year_entry.context("Failed to read year entry")?;
            if !year_entry.path().is_dir() {
                continue;
            }

            for month_entry in
                std::fs::read_dir(year_entry.path()).context("Failed to read month directory")?
            {
                let month_entry = month_entry.context("Failed to read month entry")?;
                if !month_entry.path().is_dir() {
                    continue;
                }

                for day_entry in
                    std::fs::read_dir(month_entry.path()).context("Failed to read day directory")?
                {
                    let day_entry = day_entry.context("Failed to read day entry")?;
                    if !day_entry.path().is_dir() {
                        continue;
                    }

                    for file in std::fs::read_dir(day_entry.path()).context("Failed to read day")? {
                        let file = file.context("Failed to read archive entry")?;
                        files.push(file.path());
                    }
                }
            }
        }

        Ok(files)
    }

    async fn read_log(&self, instance_id: &InstanceId) -> Result<Vec<Event>> {
        let live = self.live_path(instance_id);
        if live.exists() {
            return read_jsonl(&live).await;
        }

        match self.find_archive(instance_id).await? {
            Some(path) => read_jsonl_gz(&path),
            None => Ok(Vec::new()),
        }
    }

    /// Make the live log end on a line boundary before anything is appended
    ///
    /// A trailing fragment that holds a complete event only lost its newline
    /// and is kept; anything else is cut off.
    async fn repair_tail(&self, instance_id: &InstanceId) -> Result<()> {
        let path = self.live_path(instance_id);
        let content = match tokio::fs::read(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e).context("Failed to read event log"),
        };
        if content.is_empty() || content.ends_with(b"\n") {
            return Ok(());
        }

        let start = content
            .iter()
            .rposition(|b| *b == b'\n')
            .map_or(0, |pos| pos + 1);
        let mut file = tokio::fs::OpenOptions::new()
            .write(true)
            .open(&path)
            .await
            .context("Failed to open event log")?;

        if serde_json::from_slice::<Event>(&content[start..]).is_ok() {
            file.seek(std::io::SeekFrom::End(0))
                .await
                .context("Failed to seek event log")?;
            file.write_all(b"\n").await.context("Failed to write event")?;
        } else {
            tracing::warn!(
                "Dropping torn final line of event log for instance {} ({} bytes)",
                instance_id,
                content.len() - start
            );
            file.set_len(start as u64)
                .await
                .context("Failed to truncate event log")?;
        }
        file.sync_data().await.context("Failed to sync event log")?;

        Ok(())
    }

    async fn append_line(&self, instance_id: &InstanceId, event: &Event) -> Result<()> {
        let mut line = serde_json::to_vec(event).context("Failed to serialize event")?;
        line.push(b'\n');

        let mut file = tokio::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(self.live_path(instance_id))
            .await
            .context("Failed to open event log")?;
        file.write_all(&line).await.context("Failed to write event")?;
        file.sync_data().await.context("Failed to sync event log")?;

        Ok(())
    }
}

/// Read a JSONL file
async fn read_jsonl(path: &Path) -> Result<Vec<Event>> {
    let content = tokio::fs::read_to_string(path)
        .await
        .context("Failed to read event log")?;

    parse_lines(content.lines())
}

/// Read a JSONL.GZ file
fn read_jsonl_gz(path: &Path) -> Result<Vec<Event>> {
    use flate2::read::GzDecoder;
    use std::io::BufRead;

    let file = std::fs::File::open(path).context("Failed to open archived event log")?;
    let reader = std::io::BufReader::new(GzDecoder::new(file));

    let mut lines = Vec::new();
    for line in reader.lines() {
        lines.push(line.context("Failed to read line from event log")?);
    }

    parse_lines(lines.iter().map(String::as_str))
}

fn parse_lines<'a>(lines: impl Iterator<Item = &'a str>) -> Result<Vec<Event>> {
    let mut events = Vec::new();
    for line in lines {
        // A torn final line from a crash mid-write is not part of the log
        if line.trim().is_empty() {
            continue;
        }
        let event: Event = match serde_json::from_str(line) {
            Ok(event) => event,
            Err(e) if e.is_eof() => break,
            Err(e) => return Err(e).context("Failed to parse event"),
        };
        events.push(event);
    }
    Ok(events)
}

/// Write JSONL.GZ file
async fn write_jsonl_gz(path: &Path, events: &[Event]) -> Result<()> {
    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());

    for event in events {
        let json = serde_json::to_string(event).context("Failed to serialize event")?;
        encoder
            .write_all(json.as_bytes())
            .context("Failed to write event")?;
        encoder.write_all(b"\n").context("Failed to write newline")?;
    }

    let compressed = encoder.finish().context("Failed to finish compression")?;

    tokio::fs::write(path, compressed)
        .await
        .context("Failed to write archived event log")?;

    Ok(())
}

#[async_trait::async_trait]
impl StateStore for JsonlEventLog {
    async fn append(&self, instance_id: InstanceId, event: &Event) -> Result<(), PersistenceError> {
        let mut known = self.known.lock().await;

        if !known.contains_key(&instance_id) {
            if !self.live_path(&instance_id).exists()
                && self.find_archive(&instance_id).await?.is_some()
            {
                return Err(PersistenceError::Backend(format!(
                    "instance {} is archived",
                    instance_id
                )));
            }
            self.repair_tail(&instance_id).await?;
            let ids = self
                .read_log(&instance_id)
                .await?
                .into_iter()
                .map(|e| e.id)
                .collect();
            known.insert(instance_id, ids);
        }

        let ids = known.entry(instance_id).or_default();
        let stored_id = event
            .sequence
            .checked_sub(1)
            .and_then(|idx| ids.get(idx as usize))
            .map(String::as_str);

        if check_append(instance_id, event, ids.len() as u64, stored_id)? {
            self.append_line(&instance_id, event).await?;
            ids.push(event.id.clone());
        }

        Ok(())
    }

    async fn load_all(&self, instance_id: InstanceId) -> Result<Vec<Event>, PersistenceError> {
        let mut events = self.read_log(&instance_id).await?;
        events.sort_by_key(|e| e.sequence);
        Ok(events)
    }

    async fn archive(&self, instance_id: InstanceId) -> Result<(), PersistenceError> {
        self.archive_log(instance_id).await?;
        Ok(())
    }

    async fn list_instances(&self) -> Result<Vec<InstanceId>, PersistenceError> {
        let mut ids = Vec::new();

        let live_dir = self.base_path.join("instances");
        for entry in std::fs::read_dir(&live_dir).context("Failed to read instances directory")? {
            let entry = entry.context("Failed to read instance entry")?;
            if let Some(id) = instance_from_file(&entry.path(), ".jsonl") {
                ids.push(id);
            }
        }

        for path in self.archived_files()? {
            if let Some(id) = instance_from_file(&path, ".jsonl.gz") {
                ids.push(id);
            }
        }

        Ok(ids)
    }
}

fn instance_from_file(path: &Path, suffix: &str) -> Option<InstanceId> {
    path.file_name()?
        .to_str()?
        .strip_suffix(suffix)?
        .parse()
        .ok()
}
