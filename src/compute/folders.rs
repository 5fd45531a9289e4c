//! Per-job working directories under a cluster's temp root
//!
//! ```text
//! <root>/<jobId>/data/{inputs,transformations,outputs,logs,ddos}
//! <root>/<jobId>/tarData
//! ```

use std::io;
use std::path::{Path, PathBuf};

use tracing::warn;

use super::models::{ComputeResult, ResultKind};

#[derive(Debug, Clone)]
pub struct JobFolders {
    base: PathBuf,
}

impl JobFolders {
    pub fn new(root: &Path, job_id: &str) -> Self {
        Self {
            base: root.join(job_id),
        }
    }

    pub fn base(&self) -> &Path {
        &self.base
    }

    pub fn data(&self) -> PathBuf {
        self.base.join("data")
    }

    pub fn inputs(&self) -> PathBuf {
        self.data().join("inputs")
    }

    pub fn transformations(&self) -> PathBuf {
        self.data().join("transformations")
    }

    pub fn outputs(&self) -> PathBuf {
        self.data().join("outputs")
    }

    pub fn logs(&self) -> PathBuf {
        self.data().join("logs")
    }

    pub fn ddos(&self) -> PathBuf {
        self.data().join("ddos")
    }

    pub fn tar_data(&self) -> PathBuf {
        self.base.join("tarData")
    }

    pub fn algorithm(&self) -> PathBuf {
        self.transformations().join("algorithm")
    }

    pub fn upload_archive(&self) -> PathBuf {
        self.tar_data().join("upload.tar.gz")
    }

    pub fn outputs_archive(&self) -> PathBuf {
        self.outputs().join("outputs.tar")
    }

    pub fn log(&self, kind: ResultKind) -> PathBuf {
        match kind {
            ResultKind::ImageLog => self.logs().join("image.log"),
            ResultKind::ConfigurationLog => self.logs().join("configuration.log"),
            ResultKind::AlgorithmLog => self.logs().join("algorithm.log"),
            ResultKind::PublishLog => self.logs().join("publish.log"),
            ResultKind::Output => self.outputs_archive(),
        }
    }

    pub async fn create(&self) -> io::Result<()> {
        for dir in [
            self.inputs(),
            self.transformations(),
            self.outputs(),
            self.logs(),
            self.ddos(),
            self.tar_data(),
        ] {
            tokio::fs::create_dir_all(&dir).await?;
        }
        Ok(())
    }

    /// Append a line to one of the job logs, ignoring failures.
    pub async fn append_log(&self, kind: ResultKind, line: &str) {
        use tokio::io::AsyncWriteExt;

        let path = self.log(kind);
        let result = async {
            let mut file = tokio::fs::OpenOptions::new()
                .create(true)
                .append(true)
                .open(&path)
                .await?;
            file.write_all(line.as_bytes()).await?;
            if !line.ends_with('\n') {
                file.write_all(b"\n").await?;
            }
            file.flush().await
        }
        .await;
        if let Err(e) = result {
            warn!(path = %path.display(), error = %e, "Failed to write job log");
        }
    }

    /// Drop the staging folders once their contents are in the container.
    pub async fn remove_staging(&self) {
        for dir in [self.inputs(), self.transformations(), self.tar_data()] {
            remove_dir(&dir).await;
        }
    }

    pub async fn remove_outputs(&self) {
        remove_dir(&self.outputs()).await;
    }

    pub async fn remove_all(&self) {
        remove_dir(&self.base).await;
    }

    /// Results present on disk, in fixed order with ascending indexes.
    pub async fn results(&self) -> Vec<ComputeResult> {
        let order = [
            (ResultKind::ImageLog, "image.log"),
            (ResultKind::ConfigurationLog, "configuration.log"),
            (ResultKind::AlgorithmLog, "algorithm.log"),
            (ResultKind::Output, "outputs.tar"),
            (ResultKind::PublishLog, "publish.log"),
        ];
        let mut results = Vec::new();
        for (kind, filename) in order {
            if let Ok(meta) = tokio::fs::metadata(self.log(kind)).await {
                results.push(ComputeResult {
                    filename: filename.to_string(),
                    filesize: meta.len(),
                    kind,
                    index: results.len(),
                });
            }
        }
        results
    }
}

async fn remove_dir(dir: &Path) {
    match tokio::fs::remove_dir_all(dir).await {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
        Err(e) => warn!(path = %dir.display(), error = %e, "Could not delete job folder"),
    }
}
