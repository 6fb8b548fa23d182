//! Tar helpers for the container filesystem API
//!
//! The runtime exchanges files as tar archives: reads come back as a
//! single-entry tar and uploads are extracted relative to a target directory.

use std::io::{Cursor, Read};

use super::ContainerError;

/// One `/etc/passwd` line
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdEntry {
    pub name: String,
    pub uid: u64,
    pub gid: u64,
    pub home: String,
    pub shell: String,
}

/// Size of the first entry in a fetched archive (0 for an empty archive)
pub fn first_entry_size(archive: &[u8]) -> Result<u64, ContainerError> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    let mut entries = archive.entries()?;
    match entries.next() {
        Some(entry) => Ok(entry?.header().size()?),
        None => Ok(0),
    }
}

/// Contents of the first regular file in a fetched archive
pub fn read_first_file(archive: &[u8]) -> Result<Vec<u8>, ContainerError> {
    let mut archive = tar::Archive::new(Cursor::new(archive));
    for entry in archive.entries()? {
        let mut entry = entry?;
        if entry.header().entry_type().is_file() {
            let mut content = Vec::new();
            entry.read_to_end(&mut content)?;
            return Ok(content);
        }
    }
    Err(ContainerError::Archive("archive holds no regular file".to_string()))
}

/// Find `user` in passwd content
pub fn find_passwd_entry(passwd: &str, user: &str) -> Option<PasswdEntry> {
    passwd
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && !line.starts_with('#'))
        .find_map(|line| {
            let fields: Vec<&str> = line.split(':').collect();
            if fields.len() < 7 || fields[0] != user {
                return None;
            }
            Some(PasswdEntry {
                name: fields[0].to_string(),
                uid: fields[2].parse().ok()?,
                gid: fields[3].parse().ok()?,
                home: fields[fields.len() - 2].to_string(),
                shell: fields[fields.len() - 1].to_string(),
            })
        })
}

/// Build a tar holding `.ssh/` and `.ssh/authorized_keys` owned by uid:gid,
/// meant to be extracted into the user's home directory.
pub fn authorized_keys_archive(
    content: &str,
    uid: u64,
    gid: u64,
) -> Result<Vec<u8>, ContainerError> {
    let mtime = chrono::Utc::now().timestamp().max(0) as u64;
    let mut builder = tar::Builder::new(Vec::new());

    let mut dir = tar::Header::new_gnu();
    dir.set_entry_type(tar::EntryType::Directory);
    dir.set_path(".ssh")?;
    dir.set_mode(0o700);
    dir.set_uid(uid);
    dir.set_gid(gid);
    dir.set_size(0);
    dir.set_mtime(mtime);
    dir.set_cksum();
    builder.append(&dir, std::io::empty())?;

    let data = content.as_bytes();
    let mut file = tar::Header::new_gnu();
    file.set_entry_type(tar::EntryType::Regular);
    file.set_path(".ssh/authorized_keys")?;
    file.set_mode(0o644);
    file.set_uid(uid);
    file.set_gid(gid);
    file.set_size(data.len() as u64);
    file.set_mtime(mtime);
    file.set_cksum();
    builder.append(&file, data)?;

    Ok(builder.into_inner()?)
}
