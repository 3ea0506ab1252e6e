//! Catalog archive: `manifests/<namespace>-<name>.yaml` per entry plus a
//! generated `manifests/kustomization.yaml` listing them.

use std::collections::BTreeMap;
use std::io::{Read, Write};

use flate2::read::GzDecoder;
use flate2::{Compression, write::GzEncoder};
use tar::Header;

use crate::error::AssembleError;
use crate::resource::ResourceKey;

const ARCHIVE_DIR: &str = "manifests";
const MANIFEST_LIST: &str = "kustomization.yaml";
const MANIFEST_LIST_HEADER: &str =
    "apiVersion: kustomize.config.k8s.io/v1beta1\nkind: Kustomization\nresources:\n";

/// Build the gzipped tar for `entries`.
///
/// Files are emitted in key order with zeroed ownership and timestamps, so
/// the same entry set always yields the same bytes.
pub fn assemble(entries: &BTreeMap<ResourceKey, Vec<u8>>) -> Result<Vec<u8>, AssembleError> {
    let mut builder = tar::Builder::new(Vec::new());
    let mut listed: BTreeMap<String, &ResourceKey> = BTreeMap::new();
    let mut order = Vec::with_capacity(entries.len());
    for (key, manifest) in entries {
        let file = format!("{}.yaml", key.file_stem());
        if let Some(first) = listed.get(&file) {
            return Err(AssembleError::FileNameCollision {
                file,
                first: first.to_string(),
                second: key.to_string(),
            });
        }
        append_file(&mut builder, &file, manifest)?;
        listed.insert(file.clone(), key);
        order.push(file);
    }
    append_file(&mut builder, MANIFEST_LIST, &manifest_list(&order))?;
    let tar_bytes = builder.into_inner()?;

    let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
    encoder.write_all(&tar_bytes)?;
    Ok(encoder.finish()?)
}

/// Unpack a catalog archive into `path -> contents`.
pub fn read_archive(bytes: &[u8]) -> Result<BTreeMap<String, Vec<u8>>, AssembleError> {
    let mut archive = tar::Archive::new(GzDecoder::new(bytes));
    let mut files = BTreeMap::new();
    for entry in archive.entries()? {
        let mut entry = entry?;
        let path = entry.path()?.to_string_lossy().into_owned();
        let mut contents = Vec::new();
        entry.read_to_end(&mut contents)?;
        files.insert(path, contents);
    }
    Ok(files)
}

fn manifest_list(files: &[String]) -> Vec<u8> {
    let mut list = String::from(MANIFEST_LIST_HEADER);
    if files.is_empty() {
        list.push_str("  []\n");
    }
    for file in files {
        list.push_str("  - ");
        list.push_str(file);
        list.push('\n');
    }
    list.into_bytes()
}

fn append_file(
    builder: &mut tar::Builder<Vec<u8>>,
    file: &str,
    contents: &[u8],
) -> Result<(), AssembleError> {
    let mut header = Header::new_gnu();
    header.set_mtime(0);
    header.set_uid(0);
    header.set_gid(0);
    header.set_mode(0o644);
    header.set_entry_type(tar::EntryType::Regular);
    header.set_size(contents.len() as u64);
    builder.append_data(&mut header, format!("{ARCHIVE_DIR}/{file}"), contents)?;
    Ok(())
}
