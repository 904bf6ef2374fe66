//! Label merge and print tracking.
//!
//! Collects the label documents of one kind for one day, and either hands
//! back the single document untouched or concatenates every page of every
//! readable document into one PDF for the print station. In print mode the
//! orders behind the merged documents advance to `Printed`.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use chrono::{NaiveDate, Utc};
use labelship_types::{EventType, OrderId, SHIPPING_KIND};
use lopdf::{Document, Object, ObjectId, dictionary};
use thiserror::Error;

use crate::audit::AuditLog;
use crate::file_store::atomic_write_bytes;
use crate::reporter::Reporter;
use crate::store::{LabelStore, StoreError};

/// Where documents are collected from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentSource {
    /// Labels bought through the pipeline (kind `shipping`)
    Purchased,
    /// Manually uploaded documents
    Uploaded,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeMode {
    /// Produce the artifact only
    Preview,
    /// Produce the artifact and mark the orders printed
    Print,
}

#[derive(Debug, Clone)]
pub struct MergeRequest {
    pub kind: String,
    pub sources: Vec<DocumentSource>,
    pub date: NaiveDate,
    pub mode: MergeMode,
}

/// One document to print.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PrintDocument {
    pub order_id: Option<OrderId>,
    pub url: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
    NothingToMerge,
    /// Exactly one document: its own URL is the artifact
    Single {
        url: String,
        order_id: Option<OrderId>,
    },
    Merged {
        url: String,
        pages: usize,
        documents: usize,
        /// URLs that could not be fetched or parsed
        skipped: Vec<String>,
    },
}

impl MergeOutcome {
    pub fn url(&self) -> Option<&str> {
        match self {
            MergeOutcome::NothingToMerge => None,
            MergeOutcome::Single { url, .. } | MergeOutcome::Merged { url, .. } => Some(url),
        }
    }
}

#[derive(Debug, Error)]
pub enum MergeError {
    #[error("none of the {attempted} documents could be read as PDF")]
    NothingParsable { attempted: usize },
    #[error("failed to assemble merged PDF: {0}")]
    Pdf(String),
    #[error("failed to write merged artifact {path}: {source:#}")]
    Write {
        path: String,
        #[source]
        source: anyhow::Error,
    },
    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Loads document bytes by URL.
pub trait DocumentFetcher: Send + Sync {
    fn fetch(&self, url: &str) -> Result<Vec<u8>>;
}

/// `http(s)://` through reqwest; `file://` URLs and bare paths from disk.
#[derive(Debug, Clone)]
pub struct UrlFetcher {
    client: reqwest::blocking::Client,
}

impl UrlFetcher {
    pub fn new(timeout: Duration) -> Result<Self> {
        let client = reqwest::blocking::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build document HTTP client")?;
        Ok(Self { client })
    }
}

impl DocumentFetcher for UrlFetcher {
    fn fetch(&self, url: &str) -> Result<Vec<u8>> {
        if url.starts_with("http://") || url.starts_with("https://") {
            let response = self
                .client
                .get(url)
                .send()
                .with_context(|| format!("failed to download {url}"))?
                .error_for_status()
                .with_context(|| format!("failed to download {url}"))?;
            let bytes = response
                .bytes()
                .with_context(|| format!("failed to read body of {url}"))?;
            return Ok(bytes.to_vec());
        }
        let path = url.strip_prefix("file://").unwrap_or(url);
        fs::read(path).with_context(|| format!("failed to read {path}"))
    }
}

/// Result of [`merge_pdfs`].
#[derive(Debug)]
pub struct MergedPdf {
    pub bytes: Vec<u8>,
    pub pages: usize,
    /// Indexes of the inputs that made it in
    pub included: Vec<usize>,
    /// Indexes of the inputs that were skipped, with the reason
    pub skipped: Vec<(usize, String)>,
}

/// Attributes a page may inherit from its ancestors in the page tree.
const INHERITABLE: [&[u8]; 4] = [b"Resources", b"MediaBox", b"CropBox", b"Rotate"];

/// Page tree nodes are bounded; deeper chains are treated as cycles.
const MAX_TREE_DEPTH: usize = 64;

fn inherited_attributes(doc: &Document, page_id: ObjectId) -> Vec<(Vec<u8>, Object)> {
    let Ok(page) = doc.get_dictionary(page_id) else {
        return Vec::new();
    };
    let mut missing: Vec<&[u8]> = INHERITABLE
        .iter()
        .copied()
        .filter(|key| !page.has(key))
        .collect();
    let mut found = Vec::new();
    let mut parent = page.get(b"Parent").and_then(Object::as_reference).ok();

    for _ in 0..MAX_TREE_DEPTH {
        let Some(parent_id) = parent else { break };
        if missing.is_empty() {
            break;
        }
        let Ok(node) = doc.get_dictionary(parent_id) else {
            break;
        };
        missing.retain(|key| match node.get(key) {
            Ok(value) => {
                found.push((key.to_vec(), value.clone()));
                false
            }
            Err(_) => true,
        });
        parent = node.get(b"Parent").and_then(Object::as_reference).ok();
    }
    found
}

fn is_tree_node(object: &Object) -> bool {
    let Object::Dictionary(dict) = object else {
        return false;
    };
    matches!(
        dict.get(b"Type"),
        Ok(Object::Name(name)) if name.as_slice() == b"Catalog" || name.as_slice() == b"Pages"
    )
}

/// Concatenate the pages of every parsable input, in input order.
pub fn merge_pdfs(inputs: &[Vec<u8>]) -> Result<MergedPdf, MergeError> {
    let mut merged = Document::with_version("1.5");
    let mut page_ids: Vec<ObjectId> = Vec::new();
    let mut included = Vec::new();
    let mut skipped = Vec::new();

    for (idx, bytes) in inputs.iter().enumerate() {
        let mut doc = match Document::load_mem(bytes) {
            Ok(doc) => doc,
            Err(e) => {
                skipped.push((idx, e.to_string()));
                continue;
            }
        };
        doc.renumber_objects_with(merged.max_id + 1);
        let pages: Vec<ObjectId> = doc.get_pages().into_values().collect();
        if pages.is_empty() {
            skipped.push((idx, "document has no pages".to_string()));
            continue;
        }
        merged.max_id = doc.max_id;

        // Pages are re-parented below, so anything they inherit must be copied in first.
        for &page_id in &pages {
            let inherited = inherited_attributes(&doc, page_id);
            if let Ok(page) = doc.get_object_mut(page_id).and_then(Object::as_dict_mut) {
                for (key, value) in inherited {
                    page.set(key, value);
                }
            }
        }

        merged
            .objects
            .extend(doc.objects.into_iter().filter(|(_, obj)| !is_tree_node(obj)));
        page_ids.extend(pages);
        included.push(idx);
    }

    if page_ids.is_empty() {
        return Err(MergeError::NothingParsable {
            attempted: inputs.len(),
        });
    }

    let pages_id = merged.new_object_id();
    for &page_id in &page_ids {
        if let Ok(page) = merged.get_object_mut(page_id).and_then(Object::as_dict_mut) {
            page.set("Parent", pages_id);
        }
    }
    let kids: Vec<Object> = page_ids.iter().map(|id| Object::Reference(*id)).collect();
    merged.objects.insert(
        pages_id,
        Object::Dictionary(dictionary! {
            "Type" => "Pages",
            "Kids" => kids,
            "Count" => page_ids.len() as i64,
        }),
    );
    let catalog_id = merged.add_object(dictionary! {
        "Type" => "Catalog",
        "Pages" => pages_id,
    });
    merged.trailer.set("Root", catalog_id);

    let mut bytes = Vec::new();
    merged
        .save_to(&mut bytes)
        .map_err(|e| MergeError::Pdf(e.to_string()))?;

    Ok(MergedPdf {
        bytes,
        pages: page_ids.len(),
        included,
        skipped,
    })
}

/// Collects, merges and tracks printing of label documents.
pub struct PrintTracker {
    store: Arc<dyn LabelStore>,
    fetcher: Arc<dyn DocumentFetcher>,
    output_dir: PathBuf,
    public_base_url: Option<String>,
    audit: AuditLog,
}

impl PrintTracker {
    pub fn new(
        store: Arc<dyn LabelStore>,
        fetcher: Arc<dyn DocumentFetcher>,
        output_dir: impl Into<PathBuf>,
    ) -> Self {
        Self {
            store,
            fetcher,
            output_dir: output_dir.into(),
            public_base_url: None,
            audit: AuditLog::disabled(),
        }
    }

    pub fn with_public_base_url(mut self, base: Option<String>) -> Self {
        self.public_base_url = base.map(|b| b.trim_end_matches('/').to_string());
        self
    }

    pub fn with_audit(mut self, audit: AuditLog) -> Self {
        self.audit = audit;
        self
    }

    pub fn output_dir(&self) -> &Path {
        &self.output_dir
    }

    /// Documents of `request.kind` for `request.date` from the requested sources.
    pub fn collect(&self, request: &MergeRequest) -> Result<Vec<PrintDocument>, MergeError> {
        let mut documents = Vec::new();
        if request.sources.contains(&DocumentSource::Purchased) && request.kind == SHIPPING_KIND {
            documents.extend(
                self.store
                    .shipments_created_on(request.date)?
                    .into_iter()
                    .filter(|s| s.is_active())
                    .map(|s| PrintDocument {
                        order_id: Some(s.order_id),
                        url: s.label_url,
                    }),
            );
        }
        if request.sources.contains(&DocumentSource::Uploaded) {
            documents.extend(
                self.store
                    .label_documents_on(request.date, &request.kind)?
                    .into_iter()
                    .map(|d| PrintDocument {
                        order_id: d.order_id,
                        url: d.url,
                    }),
            );
        }
        Ok(documents)
    }

    pub fn merge_for_print(
        &self,
        request: &MergeRequest,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<MergeOutcome, MergeError> {
        let documents = self.collect(request)?;
        reporter.info(&format!(
            "{} {} document(s) for {}",
            documents.len(),
            request.kind,
            request.date
        ));
        let label = format!("{}-{}", sanitize(&request.kind), request.date);
        self.merge_documents(&label, documents, request.mode, actor, reporter)
    }

    /// Merge an explicit document list. `label` becomes part of the file name.
    pub fn merge_documents(
        &self,
        label: &str,
        mut documents: Vec<PrintDocument>,
        mode: MergeMode,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<MergeOutcome, MergeError> {
        match documents.len() {
            0 => Ok(MergeOutcome::NothingToMerge),
            1 => {
                let doc = documents.remove(0);
                if mode == MergeMode::Print {
                    self.mark_printed(doc.order_id.into_iter().collect(), &doc.url, 1, actor, reporter)?;
                }
                Ok(MergeOutcome::Single {
                    url: doc.url,
                    order_id: doc.order_id,
                })
            }
            total => {
                let mut inputs = Vec::with_capacity(total);
                let mut fetched = Vec::with_capacity(total);
                let mut skipped = Vec::new();
                for doc in documents {
                    match self.fetcher.fetch(&doc.url) {
                        Ok(bytes) => {
                            inputs.push(bytes);
                            fetched.push(doc);
                        }
                        Err(e) => {
                            reporter.warn(&format!("skipping {}: {e:#}", doc.url));
                            skipped.push(doc.url);
                        }
                    }
                }

                let merged = merge_pdfs(&inputs).map_err(|e| match e {
                    MergeError::NothingParsable { .. } => {
                        MergeError::NothingParsable { attempted: total }
                    }
                    other => other,
                })?;
                for (idx, reason) in &merged.skipped {
                    reporter.warn(&format!("skipping {}: {}", fetched[*idx].url, reason));
                    skipped.push(fetched[*idx].url.clone());
                }

                let url = self.write_artifact(label, &merged.bytes)?;
                let included: Vec<&PrintDocument> =
                    merged.included.iter().map(|idx| &fetched[*idx]).collect();
                reporter.info(&format!(
                    "merged {} document(s), {} page(s) into {}",
                    included.len(),
                    merged.pages,
                    url
                ));

                if mode == MergeMode::Print {
                    let order_ids = included.iter().filter_map(|d| d.order_id).collect();
                    self.mark_printed(order_ids, &url, included.len(), actor, reporter)?;
                }

                Ok(MergeOutcome::Merged {
                    url,
                    pages: merged.pages,
                    documents: included.len(),
                    skipped,
                })
            }
        }
    }

    fn mark_printed(
        &self,
        order_ids: Vec<OrderId>,
        artifact_url: &str,
        documents: usize,
        actor: &str,
        reporter: &mut dyn Reporter,
    ) -> Result<(), MergeError> {
        let changed = self.store.mark_printed(&order_ids)?;
        reporter.info(&format!("{changed} order(s) marked printed"));
        self.audit.record(
            EventType::LabelsPrinted {
                artifact_url: artifact_url.to_string(),
                documents,
            },
            None,
            actor,
            reporter,
        );
        Ok(())
    }

    fn write_artifact(&self, label: &str, bytes: &[u8]) -> Result<String, MergeError> {
        let file_name = format!(
            "merged-{}-{}-{:04x}.pdf",
            label,
            Utc::now().format("%H%M%S%3f"),
            rand::random::<u16>()
        );
        let path = self.output_dir.join(&file_name);
        let write_error = |source: anyhow::Error| MergeError::Write {
            path: path.display().to_string(),
            source,
        };

        fs::create_dir_all(&self.output_dir)
            .with_context(|| format!("failed to create {}", self.output_dir.display()))
            .map_err(write_error)?;
        atomic_write_bytes(&path, bytes).map_err(write_error)?;

        Ok(match &self.public_base_url {
            Some(base) => format!("{base}/{file_name}"),
            None => {
                let absolute = std::path::absolute(&path).unwrap_or_else(|_| path.clone());
                format!("file://{}", absolute.display())
            }
        })
    }
}

fn sanitize(kind: &str) -> String {
    kind.chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect()
}
