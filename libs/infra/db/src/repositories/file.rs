// [libs/infra/db/src/repositories/file.rs]
//! Server file registry and the per-agent sync ledger agents are compared
//! against during file sync.

use libsql::params;
use uuid::Uuid;

use krakenhashes_models::{AgentFileEntry, BinaryRelease, BinaryVersion, FileInfo, FileType};

use crate::client::DbClient;
use crate::errors::{mapping_error, DbError};

use super::{as_u64, opt_int, opt_text};

/// A registered server file plus where it lives on the server disk.
#[derive(Debug, Clone)]
pub struct ServerFile {
    pub info: FileInfo,
    pub server_path: String,
    pub binary_version: Option<String>,
    pub rule_count: Option<u64>,
}

pub struct FileRepository {
    database_client: DbClient,
}

impl FileRepository {
    pub fn new(database_client: DbClient) -> Self {
        Self { database_client }
    }

    pub async fn register(
        &self,
        name: &str,
        category: Option<&str>,
        file_type: FileType,
        md5: &str,
        size: u64,
        server_path: &str,
        binary_version: Option<&str>,
        rule_count: Option<u64>,
    ) -> Result<i64, DbError> {
        let connection = self.database_client.connection()?;
        connection
            .execute(
                "INSERT INTO files (name, category, file_type, md5, size, server_path, binary_version, rule_count)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
                 ON CONFLICT (file_type, name) DO UPDATE
                 SET md5 = excluded.md5, size = excluded.size,
                     server_path = excluded.server_path,
                     binary_version = excluded.binary_version,
                     rule_count = excluded.rule_count",
                params![
                    name,
                    category,
                    file_type.as_str(),
                    md5,
                    size as i64,
                    server_path,
                    binary_version,
                    rule_count.map(|count| count as i64)
                ],
            )
            .await?;

        let mut rows = connection
            .query(
                "SELECT id FROM files WHERE file_type = ?1 AND name = ?2",
                params![file_type.as_str(), name],
            )
            .await?;
        let row = rows.next().await?.ok_or(DbError::NotFound("file"))?;
        row.get::<i64>(0).map_err(DbError::Query)
    }

    pub async fn get(&self, file_type: FileType, file_id: i64) -> Result<ServerFile, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                "SELECT id, name, category, file_type, md5, size, server_path, binary_version, rule_count
                 FROM files WHERE file_type = ?1 AND id = ?2",
                params![file_type.as_str(), file_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => map_server_file(row),
            None => Err(DbError::NotFound("file")),
        }
    }

    pub async fn list(&self, file_type: Option<FileType>) -> Result<Vec<ServerFile>, DbError> {
        let connection = self.database_client.connection()?;
        let mut files = Vec::new();
        let mut rows = match file_type {
            Some(file_type) => {
                connection
                    .query(
                        "SELECT id, name, category, file_type, md5, size, server_path, binary_version, rule_count
                         FROM files WHERE file_type = ?1 ORDER BY id",
                        params![file_type.as_str()],
                    )
                    .await?
            }
            None => {
                connection
                    .query(
                        "SELECT id, name, category, file_type, md5, size, server_path, binary_version, rule_count
                         FROM files ORDER BY id",
                        (),
                    )
                    .await?
            }
        };
        while let Some(row) = rows.next().await? {
            files.push(map_server_file(row)?);
        }
        Ok(files)
    }

    /// Every registered cracker binary with a parseable version.
    pub async fn binary_releases(&self) -> Result<Vec<BinaryRelease>, DbError> {
        let mut releases = Vec::new();
        for file in self.list(Some(FileType::Binary)).await? {
            let Some(version_raw) = file.binary_version else { continue };
            let version = BinaryVersion::parse(&version_raw)
                .map_err(|error| mapping_error("binary_version", error))?;
            releases.push(BinaryRelease {
                id: file.info.id,
                version,
                archive_name: file.info.name,
            });
        }
        Ok(releases)
    }

    // --- per-agent sync ledger ----------------------------------------------

    /// Replaces the server's view of one agent's inventory.
    pub async fn replace_agent_inventory(
        &self,
        agent_id: i64,
        entries: &[AgentFileEntry],
    ) -> Result<(), DbError> {
        let connection = self.database_client.connection()?;
        let transaction = connection
            .transaction()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        transaction
            .execute("DELETE FROM agent_files WHERE agent_id = ?1", params![agent_id])
            .await?;
        for entry in entries {
            transaction
                .execute(
                    "INSERT INTO agent_files (agent_id, file_type, name, md5, size)
                     VALUES (?1, ?2, ?3, ?4, ?5)",
                    params![
                        agent_id,
                        entry.file_type.as_str(),
                        entry.name.clone(),
                        entry.md5.clone(),
                        entry.size as i64
                    ],
                )
                .await?;
        }
        transaction
            .commit()
            .await
            .map_err(|error| DbError::Transaction(error.to_string()))?;
        Ok(())
    }

    /// Files the agent is missing or holds with a stale digest. Hashlists
    /// are always included: they are re-downloaded before every benchmark
    /// and task to dodge stale hash counts.
    pub async fn out_of_sync_files(
        &self,
        agent_id: i64,
        wanted: &[FileInfo],
    ) -> Result<Vec<FileInfo>, DbError> {
        let connection = self.database_client.connection()?;
        let mut stale = Vec::new();
        for file in wanted {
            if file.file_type == FileType::Hashlist {
                stale.push(file.clone());
                continue;
            }
            let mut rows = connection
                .query(
                    "SELECT md5 FROM agent_files
                     WHERE agent_id = ?1 AND file_type = ?2 AND name = ?3",
                    params![agent_id, file.file_type.as_str(), file.name.clone()],
                )
                .await?;
            let held_md5 = match rows.next().await? {
                Some(row) => Some(row.get::<String>(0)?),
                None => None,
            };
            if held_md5.as_deref() != Some(file.md5.as_str()) {
                stale.push(file.clone());
            }
        }
        Ok(stale)
    }

    /// Agents currently holding a given hashlist file, by digest.
    pub async fn agents_holding_hashlist(&self, hashlist_id: Uuid) -> Result<Vec<i64>, DbError> {
        let connection = self.database_client.connection()?;
        let mut rows = connection
            .query(
                "SELECT agent_id FROM agent_files
                 WHERE file_type = 'hashlist' AND name = ?1",
                params![format!("{hashlist_id}.hash")],
            )
            .await?;
        let mut agents = Vec::new();
        while let Some(row) = rows.next().await? {
            agents.push(row.get::<i64>(0)?);
        }
        Ok(agents)
    }
}

fn map_server_file(row: libsql::Row) -> Result<ServerFile, DbError> {
    let type_raw = row.get::<String>(3)?;
    Ok(ServerFile {
        info: FileInfo {
            id: row.get::<i64>(0)?,
            name: row.get::<String>(1)?,
            category: opt_text(&row, 2),
            file_type: FileType::parse(&type_raw)
                .ok_or_else(|| mapping_error("file_type", &type_raw))?,
            md5: row.get::<String>(4)?,
            size: as_u64(row.get::<i64>(5)?),
        },
        server_path: row.get::<String>(6)?,
        binary_version: opt_text(&row, 7),
        rule_count: opt_int(&row, 8).map(|value| value.max(0) as u64),
    })
}
