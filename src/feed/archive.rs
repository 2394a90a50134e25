//! Raw page archive: fetched bodies written verbatim for later replay.

use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

use crate::error::Result;

#[derive(Debug, Clone)]
pub struct RawArchive {
    dir: PathBuf,
}

impl RawArchive {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write one page body. File names sort by fetch time, then page.
    pub async fn write_page(
        &self,
        fetched_at: DateTime<Utc>,
        page: u32,
        body: &[u8],
    ) -> Result<PathBuf> {
        tokio::fs::create_dir_all(&self.dir).await?;
        let path = self.dir.join(page_file_name(fetched_at, page));
        tokio::fs::write(&path, body).await?;
        Ok(path)
    }
}

fn page_file_name(fetched_at: DateTime<Utc>, page: u32) -> String {
    let stamp = fetched_at.format("%Y-%m-%dT%H-%M-%S");
    if page <= 1 {
        format!("{stamp}.json")
    } else {
        format!("{stamp}.p{page}.json")
    }
}
