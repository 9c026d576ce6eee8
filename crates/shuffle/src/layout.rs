//! On-disk layout for shuffle data.
//!
//! Each partition incarnation owns one append-only file:
//! `<mount>/rss-worker/shuffle_data/<app_id>/<shuffle_id>/<partition>-<epoch>-<role_byte>`
//!
//! There is no separate index file; chunk offsets live in memory until
//! `close()` and are served inline through the stream handle.

use std::path::{Path, PathBuf};

use rss_common::protocol::Role;
use rss_common::{Result, RssError, ShuffleKey};

const DATA_SUBDIR: &str = "rss-worker/shuffle_data";

/// Directory holding all partition files of one shuffle on one mount.
pub fn shuffle_dir(mount: &Path, key: &ShuffleKey) -> PathBuf {
    mount
        .join(DATA_SUBDIR)
        .join(&key.app_id)
        .join(key.shuffle_id.to_string())
}

/// Root directory of all shuffles of one application on one mount.
pub fn app_dir(mount: &Path, app_id: &str) -> PathBuf {
    mount.join(DATA_SUBDIR).join(app_id)
}

/// File name of one partition incarnation.
pub fn partition_file_name(partition_id: u32, epoch: u32, role: Role) -> String {
    format!("{}-{}-{}", partition_id, epoch, role.as_byte())
}

/// Full path of one partition incarnation's file.
pub fn partition_file_path(
    mount: &Path,
    key: &ShuffleKey,
    partition_id: u32,
    epoch: u32,
    role: Role,
) -> PathBuf {
    shuffle_dir(mount, key).join(partition_file_name(partition_id, epoch, role))
}

/// Parse `<partition>-<epoch>-<role_byte>` back into its parts.
pub fn parse_partition_file_name(name: &str) -> Result<(u32, u32, Role)> {
    let mut parts = name.split('-');
    let invalid = || RssError::InvalidConfig(format!("invalid partition file name: {name}"));
    let partition_id = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let epoch = parts
        .next()
        .and_then(|p| p.parse::<u32>().ok())
        .ok_or_else(invalid)?;
    let role_byte = parts
        .next()
        .and_then(|p| p.parse::<u8>().ok())
        .ok_or_else(invalid)?;
    if parts.next().is_some() {
        return Err(invalid());
    }
    Ok((partition_id, epoch, Role::from_byte(role_byte)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::Path;

    #[test]
    fn partition_path_includes_app_shuffle_and_role() {
        let key = ShuffleKey::new("app-7", 2);
        let path = partition_file_path(Path::new("/mnt/disk1"), &key, 5, 1, Role::Replica);
        assert_eq!(
            path,
            Path::new("/mnt/disk1/rss-worker/shuffle_data/app-7/2/5-1-1")
        );
    }

    #[test]
    fn file_name_round_trips() {
        let name = partition_file_name(12, 3, Role::Primary);
        assert_eq!(parse_partition_file_name(&name).unwrap(), (12, 3, Role::Primary));
        assert!(parse_partition_file_name("not-a-file-name").is_err());
    }
}
