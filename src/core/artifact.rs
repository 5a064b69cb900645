//! Database artifacts: exporting the live data store into a backup and
//! putting a backup artifact back.
//!
//! The embedded engine is exported by copying its file; the server engine by
//! running the dump utility into a SQL text file and restored by piping that
//! file into the client. Both sides snapshot the live data before overwriting
//! it and put the snapshot back if the overwrite fails. [`undo_restore`] puts
//! the same snapshot back when a later step of a larger restore fails.

use crate::{
    config::{DataStore, Engine, MysqlSettings},
    core::external::ToolInvocation,
    errors::{Error, Result},
};
use sea_orm::ConnectionTrait;
use sha2::{Digest, Sha256};
use std::io::Read;
use std::path::{Path, PathBuf};
use tracing::{error, info, instrument, warn};

/// Suffix of the checksum file written next to an artifact.
pub const CHECKSUM_SUFFIX: &str = "sha256";

/// Streams a file through SHA-256 and returns the lowercase hex digest.
pub fn checksum_file(path: &Path) -> Result<String> {
    const CHUNK_SIZE: usize = 64 * 1024;
    let file = std::fs::File::open(path).map_err(|e| Error::io(path, e))?;
    let mut reader = std::io::BufReader::with_capacity(CHUNK_SIZE, file);
    let mut hasher = Sha256::new();
    let mut buffer = vec![0u8; CHUNK_SIZE];
    loop {
        let read = reader.read(&mut buffer).map_err(|e| Error::io(path, e))?;
        if read == 0 {
            break;
        }
        hasher.update(&buffer[..read]);
    }
    Ok(format!("{:x}", hasher.finalize()))
}

/// Path of the checksum sibling for `artifact`.
#[must_use]
pub fn checksum_path(artifact: &Path) -> PathBuf {
    let mut name = artifact.as_os_str().to_os_string();
    name.push(".");
    name.push(CHECKSUM_SUFFIX);
    PathBuf::from(name)
}

/// Computes and stores the checksum of `artifact`, returning the digest.
pub fn write_checksum(artifact: &Path) -> Result<String> {
    let digest = checksum_file(artifact)?;
    let path = checksum_path(artifact);
    std::fs::write(&path, format!("{digest}\n")).map_err(|e| Error::io(&path, e))?;
    Ok(digest)
}

/// Reads a stored checksum (first whitespace-separated token).
pub fn read_checksum(path: &Path) -> Result<String> {
    let contents = std::fs::read_to_string(path).map_err(|e| Error::io(path, e))?;
    contents
        .split_whitespace()
        .next()
        .map(str::to_ascii_lowercase)
        .ok_or_else(|| Error::integrity(format!("checksum file {} is empty", path.display())))
}

fn dump_program(mysql: &MysqlSettings) -> String {
    mysql
        .dump_binary
        .as_ref()
        .map_or_else(|| "mysqldump".to_string(), |p| p.display().to_string())
}

fn client_program(mysql: &MysqlSettings) -> String {
    mysql
        .client_binary
        .as_ref()
        .map_or_else(|| "mysql".to_string(), |p| p.display().to_string())
}

fn connection_args(mysql: &MysqlSettings) -> Vec<String> {
    vec![
        format!("--host={}", mysql.host),
        format!("--port={}", mysql.port),
        format!("--user={}", mysql.username),
    ]
}

async fn mysql_dump(mysql: &MysqlSettings, dest: &Path) -> Result<()> {
    let program = dump_program(mysql);
    let mut args = connection_args(mysql);
    args.extend([
        "--single-transaction".to_string(),
        "--routines".to_string(),
        "--triggers".to_string(),
        "--add-drop-table".to_string(),
        format!("--result-file={}", dest.display()),
        mysql.database.clone(),
    ]);
    let out = ToolInvocation {
        program: &program,
        args,
        env: vec![("MYSQL_PWD", mysql.password.clone())],
        ..Default::default()
    }
    .run()
    .await?;

    let written = std::fs::metadata(dest).map(|m| m.len()).unwrap_or(0);
    if !out.exit_ok || written == 0 {
        return Err(Error::ExternalTool {
            tool: program,
            output: out.output.trim().to_string(),
        });
    }
    Ok(())
}

async fn mysql_import(mysql: &MysqlSettings, src: &Path) -> Result<()> {
    let program = client_program(mysql);
    let mut args = connection_args(mysql);
    args.push(mysql.database.clone());
    let out = ToolInvocation {
        program: &program,
        args,
        env: vec![("MYSQL_PWD", mysql.password.clone())],
        stdin: Some(src),
        ..Default::default()
    }
    .run()
    .await?;
    if !out.exit_ok {
        return Err(Error::ExternalTool {
            tool: program,
            output: out.output.trim().to_string(),
        });
    }
    Ok(())
}

fn sqlite_sidecars(live: &Path) -> [PathBuf; 2] {
    ["-wal", "-shm"].map(|suffix| {
        let mut name = live.as_os_str().to_os_string();
        name.push(suffix);
        PathBuf::from(name)
    })
}

/// Sibling the live embedded file is snapshotted to before a restore.
#[must_use]
pub fn before_restore_path(live: &Path) -> PathBuf {
    let mut name = live.as_os_str().to_os_string();
    name.push(".before_restore");
    PathBuf::from(name)
}

/// Dump of the live server database taken before a restore.
#[must_use]
pub fn server_snapshot_path(snapshot_dir: &Path) -> PathBuf {
    snapshot_dir.join("database.before_restore.sql")
}

/// Writes the live data store into `dest`.
#[instrument(skip(store))]
pub async fn export_database(store: &DataStore, dest: &Path) -> Result<()> {
    match store.engine() {
        Engine::Embedded { path } => {
            if !path.is_file() {
                return Err(Error::io(
                    path,
                    std::io::Error::new(std::io::ErrorKind::NotFound, "database file missing"),
                ));
            }
            if store.is_connected().await {
                // Fold the write-ahead log into the main file so the copy is complete.
                let conn = store.connection().await?;
                if let Err(e) = conn
                    .execute_unprepared("PRAGMA wal_checkpoint(TRUNCATE)")
                    .await
                {
                    warn!("WAL checkpoint before backup failed: {}", e);
                }
            }
            std::fs::copy(path, dest).map_err(|e| Error::io(dest, e))?;
        }
        Engine::Server(mysql) => mysql_dump(mysql, dest).await?,
    }
    info!("Database exported to {}", dest.display());
    Ok(())
}

/// Replaces the live data store with the artifact at `src`.
///
/// The connection is closed first and reopened afterwards. The live data is
/// snapshotted (embedded: `<file>.before_restore`; server:
/// `<snapshot_dir>/database.before_restore.sql`) and put back if the
/// overwrite fails.
#[instrument(skip(store))]
pub async fn restore_database(store: &DataStore, src: &Path, snapshot_dir: &Path) -> Result<()> {
    store.disconnect().await?;

    let result = match store.engine() {
        Engine::Embedded { path } => restore_embedded(path, src),
        Engine::Server(mysql) => restore_server(mysql, src, snapshot_dir).await,
    };

    if let Err(e) = store.connection().await {
        warn!("Reconnect after restore failed: {}", e);
    }
    result
}

/// Puts back the data replaced by the last successful [`restore_database`].
#[instrument(skip(store))]
pub async fn undo_restore(store: &DataStore, snapshot_dir: &Path) -> Result<()> {
    store.disconnect().await?;

    let result = match store.engine() {
        Engine::Embedded { path } => undo_embedded(path),
        Engine::Server(mysql) => mysql_import(mysql, &server_snapshot_path(snapshot_dir)).await,
    };

    if let Err(e) = store.connection().await {
        warn!("Reconnect after undoing restore failed: {}", e);
    }
    result
}

fn remove_sidecars(live: &Path) -> Result<()> {
    for sidecar in sqlite_sidecars(live) {
        if sidecar.exists() {
            std::fs::remove_file(&sidecar).map_err(|e| Error::io(&sidecar, e))?;
        }
    }
    Ok(())
}

fn undo_embedded(live: &Path) -> Result<()> {
    let snapshot = before_restore_path(live);
    remove_sidecars(live)?;
    if snapshot.is_file() {
        std::fs::copy(&snapshot, live).map_err(|e| Error::io(live, e))?;
        info!("Embedded database put back from {}", snapshot.display());
    } else if live.exists() {
        // Nothing existed before the restore.
        std::fs::remove_file(live).map_err(|e| Error::io(live, e))?;
    }
    Ok(())
}

fn restore_embedded(live: &Path, src: &Path) -> Result<()> {
    let snapshot = before_restore_path(live);
    let had_live = live.is_file();
    if had_live {
        std::fs::copy(live, &snapshot).map_err(|e| Error::io(&snapshot, e))?;
    } else if snapshot.exists() {
        std::fs::remove_file(&snapshot).map_err(|e| Error::io(&snapshot, e))?;
    }
    remove_sidecars(live)?;

    if let Err(e) = std::fs::copy(src, live) {
        error!("Copying backup over live database failed: {}", e);
        if had_live {
            if let Err(back) = std::fs::copy(&snapshot, live) {
                error!("Putting the pre-restore snapshot back failed: {}", back);
            }
        }
        return Err(Error::io(live, e));
    }
    info!("Embedded database restored from {}", src.display());
    Ok(())
}

async fn restore_server(mysql: &MysqlSettings, src: &Path, snapshot_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(snapshot_dir).map_err(|e| Error::io(snapshot_dir, e))?;
    let snapshot = server_snapshot_path(snapshot_dir);
    mysql_dump(mysql, &snapshot).await?;

    if let Err(e) = mysql_import(mysql, src).await {
        error!("Importing backup failed, re-importing snapshot: {}", e);
        if let Err(back) = mysql_import(mysql, &snapshot).await {
            error!("Re-importing the pre-restore snapshot failed: {}", back);
        }
        return Err(e);
    }
    info!("Server database restored from {}", src.display());
    Ok(())
}
