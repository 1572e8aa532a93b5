//! Input side of the batch pipeline: lines in, work items out.

use std::path::Path;

use anyhow::Context;
use tokio::fs::File;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::mpsc;
use tracing::debug;

/// One input line.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Element {
    /// Position among the non-blank input lines, from 0.
    pub sequence_index: u64,
    pub instance_id: String,
    pub line: String,
}

/// What a worker sends in one call: a single line, or a mini-batch of lines
/// under one call-level correlation id.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WorkItem {
    pub correlation_id: String,
    pub elements: Vec<Element>,
}

impl WorkItem {
    fn new(elements: Vec<Element>) -> Self {
        let correlation_id = match elements.as_slice() {
            [single] => single.instance_id.clone(),
            _ => uuid::Uuid::new_v4().to_string(),
        };
        Self {
            correlation_id,
            elements,
        }
    }
}

/// Streams `path` into `tx`, `batch_size` lines per item. Returns the number
/// of lines read. The queue closes when this returns and `tx` drops.
///
/// # Errors
///
/// Fails when the file cannot be read or every worker has gone away.
pub async fn read_items(
    path: &Path,
    batch_size: usize,
    tx: mpsc::Sender<WorkItem>,
) -> anyhow::Result<u64> {
    let file = File::open(path)
        .await
        .with_context(|| format!("opening input {}", path.display()))?;
    let mut lines = BufReader::new(file).lines();
    let batch_size = batch_size.max(1);

    let mut sequence_index = 0u64;
    let mut pending = Vec::with_capacity(batch_size);
    while let Some(line) = lines.next_line().await.context("reading input")? {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        pending.push(Element {
            sequence_index,
            instance_id: uuid::Uuid::new_v4().to_string(),
            line: line.to_string(),
        });
        sequence_index += 1;

        if pending.len() == batch_size {
            let item = WorkItem::new(std::mem::replace(
                &mut pending,
                Vec::with_capacity(batch_size),
            ));
            tx.send(item)
                .await
                .map_err(|_| anyhow::anyhow!("work queue closed before input was exhausted"))?;
        }
    }
    if !pending.is_empty() {
        tx.send(WorkItem::new(pending))
            .await
            .map_err(|_| anyhow::anyhow!("work queue closed before input was exhausted"))?;
    }

    debug!(lines = sequence_index, "input exhausted");
    Ok(sequence_index)
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    fn input(contents: &str) -> tempfile::NamedTempFile {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(contents.as_bytes()).unwrap();
        file
    }

    async fn collect(path: &Path, batch_size: usize) -> (u64, Vec<WorkItem>) {
        let (tx, mut rx) = mpsc::channel(4);
        let reader = tokio::spawn({
            let path = path.to_path_buf();
            async move { read_items(&path, batch_size, tx).await }
        });
        let mut items = Vec::new();
        while let Some(item) = rx.recv().await {
            items.push(item);
        }
        (reader.await.unwrap().unwrap(), items)
    }

    #[tokio::test]
    async fn skips_blank_lines_and_numbers_the_rest() {
        let file = input("[1,2]\n\n   \n[3,4]\n[5,6]\n");
        let (count, items) = collect(file.path(), 1).await;
        assert_eq!(count, 3);
        assert_eq!(items.len(), 3);
        let indices: Vec<u64> = items.iter().map(|i| i.elements[0].sequence_index).collect();
        assert_eq!(indices, vec![0, 1, 2]);
        assert_eq!(items[1].elements[0].line, "[3,4]");
        for item in &items {
            assert_eq!(item.correlation_id, item.elements[0].instance_id);
        }
    }

    #[tokio::test]
    async fn groups_into_mini_batches_with_a_short_tail() {
        let file = input("[1]\n[2]\n[3]\n[4]\n[5]\n");
        let (count, items) = collect(file.path(), 2).await;
        assert_eq!(count, 5);
        let sizes: Vec<usize> = items.iter().map(|i| i.elements.len()).collect();
        assert_eq!(sizes, vec![2, 2, 1]);
        assert_ne!(items[0].correlation_id, items[0].elements[0].instance_id);
        assert_eq!(items[2].elements[0].sequence_index, 4);
    }

    #[tokio::test]
    async fn missing_file_is_an_error() {
        let (tx, _rx) = mpsc::channel(1);
        let err = read_items(Path::new("/nonexistent/input.txt"), 1, tx)
            .await
            .unwrap_err();
        assert!(err.to_string().contains("opening input"));
    }
}
