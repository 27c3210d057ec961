//! Transfer planning.
//!
//! Builds the transfer descriptors a task hands to the external worker.
//! Records are grouped by source location in the order they were classified.
//! Allocation and ownership changes additionally bin-pack each group into
//! chunks bounded by `max_xfr_size`; GET and PUT produce one descriptor per
//! source.

use serde::{Deserialize, Serialize};

use datafed_core::{RecordId, RepoId, SubjectId};

use crate::error::{Error, Result};
use crate::model::Repo;
use crate::preprocess::ClassifiedRecord;
use crate::store::Transaction;

/// One file inside a transfer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferFile {
    /// Record owning the file.
    pub id: RecordId,
    /// Size in bytes.
    pub size: u64,
    /// File name at the source.
    pub from: String,
    /// File name at the destination.
    pub to: String,
}

/// A batch of files moved between two endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferDescriptor {
    /// Source repository; `None` for a remote or external endpoint.
    pub src_repo: Option<RepoId>,
    /// Source endpoint.
    pub src_endpoint: String,
    /// Source directory.
    pub src_path: String,
    /// Destination repository; `None` for a remote endpoint.
    pub dst_repo: Option<RepoId>,
    /// Destination endpoint.
    pub dst_endpoint: String,
    /// Destination directory.
    pub dst_path: String,
    /// Files to move.
    pub files: Vec<TransferFile>,
    /// Aggregate size of `files`.
    pub size: u64,
}

impl TransferDescriptor {
    /// Ids of every record in the transfer.
    #[must_use]
    pub fn record_ids(&self) -> Vec<RecordId> {
        self.files.iter().map(|f| f.id.clone()).collect()
    }
}

/// Raw data files of one repository directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepoFiles {
    /// Repository.
    pub repo_id: RepoId,
    /// Directory inside the repository.
    pub repo_path: String,
    /// Records whose files are addressed.
    pub ids: Vec<RecordId>,
}

/// An allocation's storage directory.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AllocTarget {
    /// Repository.
    pub repo_id: RepoId,
    /// Directory inside the repository.
    pub repo_path: String,
}

/// Splits `endpoint/path` into its endpoint and the path (with leading `/`).
///
/// # Errors
///
/// Returns `InvalidParam` when there is no endpoint before the first `/`.
pub fn split_remote(remote: &str) -> Result<(String, String)> {
    match remote.find('/') {
        Some(idx) if idx > 0 => Ok((remote[..idx].to_string(), remote[idx..].to_string())),
        _ => Err(Error::InvalidParam(
            "invalid remote path (must include endpoint)".into(),
        )),
    }
}

fn file_name(path: &str) -> &str {
    path.rsplit_once('/').map_or(path, |(_, name)| name)
}

struct SourceGroup {
    repo: Option<RepoId>,
    endpoint: String,
    path: String,
    files: Vec<TransferFile>,
}

#[derive(Default)]
struct Groups(Vec<SourceGroup>);

impl Groups {
    fn push(&mut self, repo: Option<RepoId>, endpoint: String, path: String, file: TransferFile) {
        if let Some(group) = self
            .0
            .iter_mut()
            .find(|g| g.repo == repo && g.endpoint == endpoint && g.path == path)
        {
            group.files.push(file);
        } else {
            self.0.push(SourceGroup {
                repo,
                endpoint,
                path,
                files: vec![file],
            });
        }
    }
}

/// Resolves where a managed record's raw data currently lives.
fn source_of(tx: &dyn Transaction, record: &RecordId) -> Result<(Repo, String)> {
    let loc = tx.location(record)?.ok_or_else(|| {
        Error::InternalFault(format!("record '{record}' has no storage location"))
    })?;
    let repo = tx.require_repo(&loc.repo)?;
    let path = repo.subject_path(&loc.uid);
    Ok((repo, path))
}

fn managed_groups<F>(tx: &dyn Transaction, records: &[ClassifiedRecord], mut name: F) -> Result<Groups>
where
    F: FnMut(&ClassifiedRecord) -> Result<(String, String)>,
{
    let mut groups = Groups::default();
    for rec in records {
        let (repo, path) = source_of(tx, &rec.id)?;
        let (from, to) = name(rec)?;
        groups.push(
            Some(repo.id.clone()),
            repo.endpoint.clone(),
            path,
            TransferFile {
                id: rec.id.clone(),
                size: rec.size,
                from,
                to,
            },
        );
    }
    Ok(groups)
}

/// Plans a download of managed and external records to `remote`.
///
/// With `orig_fname`, files keep the name of their original source file and
/// two files with the same name are a `TransferConflict`.
///
/// # Errors
///
/// Returns `InvalidParam` for a malformed remote or external source path and
/// `TransferConflict` for duplicate destination names.
pub fn plan_get(
    tx: &dyn Transaction,
    managed: &[ClassifiedRecord],
    external: &[ClassifiedRecord],
    remote: &str,
    orig_fname: bool,
) -> Result<Vec<TransferDescriptor>> {
    let (dst_endpoint, mut dst_path) = split_remote(remote)?;
    if !dst_path.ends_with('/') {
        dst_path.push('/');
    }

    let mut names = std::collections::HashSet::new();
    let mut claim = |name: String| -> Result<String> {
        if orig_fname && !names.insert(name.clone()) {
            return Err(Error::TransferConflict(
                "duplicate filename(s) detected in transfer request".into(),
            ));
        }
        Ok(name)
    };

    let mut groups = managed_groups(tx, managed, |rec| {
        let from = rec.id.key().to_string();
        let ext = rec.ext.as_deref().unwrap_or_default();
        let to = match (orig_fname, rec.source.as_deref()) {
            (true, Some(source)) => claim(file_name(source).to_string())?,
            _ => format!("{from}{ext}"),
        };
        Ok((from, to))
    })?;

    for rec in external {
        let source = rec.source.as_deref().unwrap_or_default();
        let Some(idx) = source.find('/') else {
            return Err(Error::InvalidParam(format!(
                "invalid external source path: {source}"
            )));
        };
        let (endpoint, src) = source.split_at(idx);
        let to = if orig_fname {
            claim(file_name(src).to_string())?
        } else {
            rec.id.key().to_string()
        };
        groups.push(
            None,
            endpoint.to_string(),
            String::new(),
            TransferFile {
                id: rec.id.clone(),
                size: rec.size,
                from: src.to_string(),
                to,
            },
        );
    }

    Ok(groups
        .0
        .into_iter()
        .map(|g| descriptor(g.repo, g.endpoint, g.path, None, &dst_endpoint, &dst_path, g.files))
        .collect())
}

/// Plans an upload of one remote file into the record's managed storage.
///
/// # Errors
///
/// Returns `InvalidParam` when `remote` lacks an endpoint or a file name.
pub fn plan_put(
    tx: &dyn Transaction,
    records: &[ClassifiedRecord],
    remote: &str,
) -> Result<Vec<TransferDescriptor>> {
    let (src_endpoint, rem_path) = split_remote(remote)?;
    let (dir, fname) = rem_path
        .rsplit_once('/')
        .map(|(dir, name)| (format!("{dir}/"), name.to_string()))
        .unwrap_or_default();
    if fname.is_empty() {
        return Err(Error::InvalidParam(
            "invalid source path (must name a file)".into(),
        ));
    }

    let mut out = Vec::new();
    for rec in records {
        let (repo, path) = source_of(tx, &rec.id)?;
        let file = TransferFile {
            id: rec.id.clone(),
            size: rec.size,
            from: fname.clone(),
            to: rec.id.key().to_string(),
        };
        out.push(descriptor(
            None,
            src_endpoint.clone(),
            dir.clone(),
            Some(repo.id.clone()),
            &repo.endpoint,
            &path,
            vec![file],
        ));
    }
    Ok(out)
}

/// Plans moving managed records into `owner`'s allocation on `dst_repo`,
/// chunked by `max_xfr_size`.
///
/// # Errors
///
/// Returns `InternalFault` when a record has no storage location.
pub fn plan_move(
    tx: &dyn Transaction,
    records: &[ClassifiedRecord],
    dst_repo: &Repo,
    owner: &SubjectId,
    max_xfr_size: u64,
) -> Result<Vec<TransferDescriptor>> {
    let dst_path = dst_repo.subject_path(owner);
    let groups = managed_groups(tx, records, |rec| {
        let key = rec.id.key().to_string();
        Ok((key.clone(), key))
    })?;

    let mut out = Vec::new();
    for group in groups.0 {
        for chunk in pack_chunks(group.files, max_xfr_size) {
            out.push(descriptor(
                group.repo.clone(),
                group.endpoint.clone(),
                group.path.clone(),
                Some(dst_repo.id.clone()),
                &dst_repo.endpoint,
                &dst_path,
                chunk,
            ));
        }
    }
    Ok(out)
}

/// Groups managed records by the repository directory holding their data.
/// Records without a storage location are skipped.
///
/// # Errors
///
/// Returns an error if the store fails.
pub fn plan_delete(tx: &dyn Transaction, records: &[RecordId]) -> Result<Vec<RepoFiles>> {
    let mut out: Vec<RepoFiles> = Vec::new();
    for id in records {
        let Some(loc) = tx.location(id)? else {
            continue;
        };
        let repo = tx.require_repo(&loc.repo)?;
        let repo_path = repo.subject_path(&loc.uid);
        match out
            .iter_mut()
            .find(|g| g.repo_id == repo.id && g.repo_path == repo_path)
        {
            Some(group) => group.ids.push(id.clone()),
            None => out.push(RepoFiles {
                repo_id: repo.id,
                repo_path,
                ids: vec![id.clone()],
            }),
        }
    }
    Ok(out)
}

/// Bin-packs files into chunks whose aggregate size stays within `max_size`.
///
/// Files are taken largest first. A file at or above `max_size` travels
/// alone; every other chunk is seeded with the largest unassigned file and
/// filled greedily with the largest remaining files that still fit.
#[must_use]
pub fn pack_chunks(mut files: Vec<TransferFile>, max_size: u64) -> Vec<Vec<TransferFile>> {
    files.sort_by(|a, b| b.size.cmp(&a.size));

    let split = files
        .iter()
        .position(|f| f.size < max_size)
        .unwrap_or(files.len());
    let small = files.split_off(split);

    let mut chunks: Vec<Vec<TransferFile>> = files.into_iter().map(|f| vec![f]).collect();
    let mut pending: Vec<Option<TransferFile>> = small.into_iter().map(Some).collect();

    for i in 0..pending.len() {
        let Some(seed) = pending[i].take() else {
            continue;
        };
        let mut total = seed.size;
        let mut chunk = vec![seed];

        for slot in pending.iter_mut().skip(i + 1) {
            if slot
                .as_ref()
                .is_some_and(|f| total.saturating_add(f.size) <= max_size)
            {
                if let Some(file) = slot.take() {
                    total += file.size;
                    chunk.push(file);
                }
            }
        }
        chunks.push(chunk);
    }

    chunks
}

fn descriptor(
    src_repo: Option<RepoId>,
    src_endpoint: String,
    src_path: String,
    dst_repo: Option<RepoId>,
    dst_endpoint: &str,
    dst_path: &str,
    files: Vec<TransferFile>,
) -> TransferDescriptor {
    let size = files.iter().map(|f| f.size).sum();
    TransferDescriptor {
        src_repo,
        src_endpoint,
        src_path,
        dst_repo,
        dst_endpoint: dst_endpoint.to_string(),
        dst_path: dst_path.to_string(),
        files,
        size,
    }
}
