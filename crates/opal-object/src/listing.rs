//! Object listing
//!
//! Lexicographic walk over one disk's view of a bucket, shared by both
//! backends. The FS backend treats plain files as objects; the erasure
//! backend treats a directory carrying `xl.json` as an object and never
//! descends into it.

use futures::future::BoxFuture;
use futures::FutureExt;

use opal_common::error::{Error, Result};
use opal_disk::StorageDisk;

use crate::meta::XL_META_FILE;

/// Hard ceiling on keys per listing page, as in S3.
pub const MAX_LIST_KEYS: usize = 1000;

/// What counts as an object leaf during the walk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ListLeaf {
    /// Plain files are objects (FS backend).
    File,
    /// Directories containing `xl.json` are objects (erasure backend).
    XlDir,
}

/// Raw listing output: keys and common prefixes, both sorted
#[derive(Clone, Debug, Default)]
pub struct RawListing {
    pub keys: Vec<String>,
    pub prefixes: Vec<String>,
    pub is_truncated: bool,
}

struct Walker<'a> {
    disk: &'a dyn StorageDisk,
    bucket: &'a str,
    leaf: ListLeaf,
    prefix: &'a str,
    marker: &'a str,
    recursive: bool,
    limit: usize,
    out: RawListing,
}

impl<'a> Walker<'a> {
    fn full(&self) -> bool {
        self.out.keys.len() + self.out.prefixes.len() >= self.limit
    }

    async fn is_object_dir(&self, dir: &str) -> bool {
        match self.leaf {
            ListLeaf::File => false,
            ListLeaf::XlDir => self
                .disk
                .stat_file(self.bucket, &format!("{dir}/{XL_META_FILE}"))
                .await
                .is_ok(),
        }
    }

    fn push_key(&mut self, key: String) {
        if key.as_str() > self.marker && key.starts_with(self.prefix) {
            self.out.keys.push(key);
        }
    }

    fn push_prefix(&mut self, prefix: String) {
        if prefix.starts_with(self.prefix) && prefix.as_str() > self.marker {
            self.out.prefixes.push(prefix);
        }
    }

    /// Walk `dir` (`""` for the bucket root) in sorted order.
    fn walk(&mut self, dir: String) -> BoxFuture<'_, Result<()>> {
        async move {
            let mut entries = match self.disk.list_dir(self.bucket, &dir).await {
                Ok(entries) => entries,
                Err(e) if e.is_not_found() => return Ok(()),
                Err(e) => return Err(e),
            };
            entries.sort();

            for entry in entries {
                if self.full() {
                    self.out.is_truncated = true;
                    return Ok(());
                }
                let path = if dir.is_empty() {
                    entry.clone()
                } else {
                    format!("{dir}/{}", entry.trim_end_matches('/'))
                };
                let path = path.trim_end_matches('/').to_string();

                // Subtrees that can neither match the prefix nor sort
                // past the marker are skipped whole.
                if !path.starts_with(self.prefix) && !self.prefix.starts_with(&path) {
                    continue;
                }

                if entry.ends_with('/') {
                    if self.is_object_dir(&path).await {
                        self.push_key(path);
                        continue;
                    }
                    if self.recursive {
                        self.walk(path).await?;
                    } else {
                        self.push_prefix(format!("{path}/"));
                    }
                } else if self.leaf == ListLeaf::File {
                    self.push_key(path);
                }
            }
            Ok(())
        }
        .boxed()
    }
}

/// List up to `max_keys` objects under `bucket` with S3 semantics.
///
/// Only the empty delimiter (recursive) and `/` (one level plus common
/// prefixes) are supported.
pub async fn list_objects_raw(
    disk: &dyn StorageDisk,
    leaf: ListLeaf,
    bucket: &str,
    prefix: &str,
    marker: &str,
    delimiter: &str,
    max_keys: usize,
) -> Result<RawListing> {
    if !delimiter.is_empty() && delimiter != "/" {
        return Err(Error::not_implemented(format!(
            "delimiter {delimiter:?} is not supported"
        )));
    }
    let max_keys = max_keys.min(MAX_LIST_KEYS);
    if max_keys == 0 {
        return Ok(RawListing::default());
    }

    // Start the walk at the deepest directory the prefix pins down.
    let start_dir = match prefix.rfind('/') {
        Some(idx) => prefix[..idx].to_string(),
        None => String::new(),
    };

    let mut walker = Walker {
        disk,
        bucket,
        leaf,
        prefix,
        marker,
        recursive: delimiter.is_empty(),
        // One extra slot decides truncation.
        limit: max_keys + 1,
        out: RawListing::default(),
    };
    walker.walk(start_dir).await?;

    let mut out = walker.out;
    let mut all: Vec<(String, bool)> = out
        .keys
        .drain(..)
        .map(|k| (k, false))
        .chain(out.prefixes.drain(..).map(|p| (p, true)))
        .collect();
    all.sort();
    if all.len() > max_keys {
        all.truncate(max_keys);
        out.is_truncated = true;
    }
    for (name, is_prefix) in all {
        if is_prefix {
            out.prefixes.push(name);
        } else {
            out.keys.push(name);
        }
    }
    Ok(out)
}
