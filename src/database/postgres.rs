use super::{sort_aliases, FingerprintRow, Observation, RegistryStore, StoreError};
use crate::address::ServerAddress;
use crate::config;
use crate::dedup::merge::{IdentityState, MergeStep, RegistryWrite, StepOutcome};
use crate::models::{AliasEdge, DnsEntry, ServerRecord, Snapshot};
use crate::schema::{self, AliasRow, FingerprintSqlRow, ServerRow, SnapshotRow};
use async_trait::async_trait;
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgConnection, Pool, Postgres};
use tracing::{debug, info};

/// Key for the transaction-scoped lock every merge pass takes
const MERGE_LOCK_KEY: i64 = 0x6d63_7265_6769;

const SERVER_COLUMNS: &str = "address, country, isp, favicon_hash, favicon_raw, resolved_ip, \
	last_dns_check, is_canonical, canonical_of, first_seen, last_seen";

#[derive(Debug, Clone)]
pub struct PgRegistry {
	pool: Pool<Postgres>,
}

impl PgRegistry {
	pub async fn connect(config: &config::Database) -> Result<Self, StoreError> {
		let pool = PgPoolOptions::new()
			.max_connections(config.max_connections)
			.connect(&config.connection_string())
			.await?;

		info!("Connected to database {}:{}", config.url, config.port);
		Self::from_pool(pool).await
	}

	pub async fn from_pool(pool: Pool<Postgres>) -> Result<Self, StoreError> {
		sqlx::raw_sql(schema::SCHEMA).execute(&pool).await?;
		debug!("Schema is up to date");
		Ok(Self { pool })
	}

	async fn apply_write(
		conn: &mut PgConnection,
		write: &RegistryWrite,
	) -> Result<(), sqlx::Error> {
		match write {
			RegistryWrite::MarkCanonical { address } => {
				let updated = sqlx::query(
					"UPDATE servers SET is_canonical = TRUE, canonical_of = NULL WHERE address = $1",
				)
				.bind(address.to_string())
				.execute(&mut *conn)
				.await?;
				if updated.rows_affected() == 0 {
					return Err(sqlx::Error::RowNotFound);
				}

				sqlx::query("DELETE FROM server_aliases WHERE alias_address = $1")
					.bind(address.to_string())
					.execute(&mut *conn)
					.await?;
			}
			RegistryWrite::MarkAlias { address, canonical } => {
				let updated = sqlx::query(
					"UPDATE servers SET is_canonical = FALSE, canonical_of = $2, favicon_raw = NULL WHERE address = $1",
				)
				.bind(address.to_string())
				.bind(canonical.to_string())
				.execute(&mut *conn)
				.await?;
				if updated.rows_affected() == 0 {
					return Err(sqlx::Error::RowNotFound);
				}
			}
			RegistryWrite::UpsertEdge(edge) => {
				sqlx::query(
					"INSERT INTO server_aliases (alias_address, canonical_address, detection_method, confidence, created_at)
					VALUES ($1, $2, $3, $4, $5)
					ON CONFLICT (alias_address) DO UPDATE SET
					canonical_address = EXCLUDED.canonical_address,
					detection_method = EXCLUDED.detection_method,
					confidence = EXCLUDED.confidence,
					created_at = EXCLUDED.created_at
					WHERE server_aliases.canonical_address <> EXCLUDED.canonical_address
					OR EXCLUDED.confidence > server_aliases.confidence",
				)
				.bind(edge.alias_address.to_string())
				.bind(edge.canonical_address.to_string())
				.bind(edge.detection_method.as_str())
				.bind(edge.confidence)
				.bind(edge.created_at)
				.execute(&mut *conn)
				.await?;
			}
		}

		Ok(())
	}

	/// Runs one step inside the current savepoint, `Ok(Err)` if it has to be undone
	async fn apply_step(
		conn: &mut PgConnection,
		step: &MergeStep,
	) -> Result<Result<(), String>, sqlx::Error> {
		for write in &step.writes {
			if let Err(e) = Self::apply_write(conn, write).await {
				return Ok(Err(e.to_string()));
			}
		}

		let check = sqlx::query_as::<_, (i64,)>(schema::INVARIANT_VIOLATIONS)
			.fetch_one(&mut *conn)
			.await;
		let (violations,) = match check {
			Ok(row) => row,
			Err(e) => return Ok(Err(e.to_string())),
		};

		if violations > 0 {
			return Ok(Err(format!("step would leave {violations} broken alias rows")));
		}

		Ok(Ok(()))
	}
}

#[async_trait]
impl RegistryStore for PgRegistry {
	async fn create_scan(&self) -> Result<i64, StoreError> {
		let (id,): (i64,) = sqlx::query_as("INSERT INTO scans DEFAULT VALUES RETURNING id")
			.fetch_one(&self.pool)
			.await?;
		Ok(id)
	}

	async fn get_server(
		&self,
		address: &ServerAddress,
	) -> Result<Option<ServerRecord>, StoreError> {
		let query = format!("SELECT {SERVER_COLUMNS} FROM servers WHERE address = $1");
		let row: Option<ServerRow> = sqlx::query_as(&query)
			.bind(address.to_string())
			.fetch_optional(&self.pool)
			.await?;

		row.map(ServerRecord::try_from).transpose()
	}

	async fn upsert_server(&self, observation: &Observation) -> Result<ServerRecord, StoreError> {
		let row: ServerRow = sqlx::query_as(&format!(
			"INSERT INTO servers (address, country, isp, favicon_hash, favicon_raw, resolved_ip, last_dns_check,
			is_canonical, canonical_of, first_seen, last_seen)
			VALUES ($1, $2, $3, $4, $5, $6, $7, TRUE, NULL, $8, $8)
			ON CONFLICT (address) DO UPDATE SET
			country = COALESCE(EXCLUDED.country, servers.country),
			isp = COALESCE(EXCLUDED.isp, servers.isp),
			favicon_hash = EXCLUDED.favicon_hash,
			favicon_raw = CASE WHEN servers.is_canonical THEN EXCLUDED.favicon_raw ELSE NULL END,
			resolved_ip = CASE WHEN EXCLUDED.last_dns_check IS NULL THEN servers.resolved_ip ELSE EXCLUDED.resolved_ip END,
			last_dns_check = COALESCE(EXCLUDED.last_dns_check, servers.last_dns_check),
			last_seen = EXCLUDED.last_seen
			RETURNING {SERVER_COLUMNS}"
		))
		.bind(observation.address.to_string())
		.bind(&observation.geo.country)
		.bind(&observation.geo.isp)
		.bind(&observation.favicon_hash)
		.bind(&observation.favicon_raw)
		.bind(observation.resolved_ip.map(|ip| ip.to_string()))
		.bind(observation.last_dns_check)
		.bind(observation.seen_at)
		.fetch_one(&self.pool)
		.await?;

		ServerRecord::try_from(row)
	}

	async fn append_snapshot(&self, snapshot: &Snapshot) -> Result<(), StoreError> {
		sqlx::query(
			"INSERT INTO server_snapshots (scan_id, address, version, online, max_players, auth_mode, sample_size, timestamp)
			VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
		)
		.bind(snapshot.scan_id)
		.bind(snapshot.address.to_string())
		.bind(&snapshot.version)
		.bind(snapshot.online)
		.bind(snapshot.max_players)
		.bind(snapshot.auth_mode.as_str())
		.bind(snapshot.sample_size)
		.bind(snapshot.timestamp)
		.execute(&self.pool)
		.await?;

		Ok(())
	}

	async fn snapshots_of(&self, address: &ServerAddress) -> Result<Vec<Snapshot>, StoreError> {
		let rows: Vec<SnapshotRow> = sqlx::query_as(
			"SELECT scan_id, address, version, online, max_players, auth_mode, sample_size, timestamp
			FROM server_snapshots WHERE address = $1 ORDER BY id ASC",
		)
		.bind(address.to_string())
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter().map(Snapshot::try_from).collect()
	}

	async fn purge_server(&self, address: &ServerAddress) -> Result<bool, StoreError> {
		let mut transaction = self.pool.begin().await?;

		// Release followers first, canonical_of references the row being deleted
		sqlx::query(
			"UPDATE servers SET is_canonical = TRUE, canonical_of = NULL WHERE canonical_of = $1",
		)
		.bind(address.to_string())
		.execute(&mut *transaction)
		.await?;

		// Snapshots and alias edges cascade
		let deleted = sqlx::query("DELETE FROM servers WHERE address = $1")
			.bind(address.to_string())
			.execute(&mut *transaction)
			.await?;

		transaction.commit().await?;
		Ok(deleted.rows_affected() > 0)
	}

	async fn cached_dns(&self, address: &ServerAddress) -> Result<Option<DnsEntry>, StoreError> {
		let row: Option<(Option<String>, Option<chrono::DateTime<chrono::Utc>>)> =
			sqlx::query_as("SELECT resolved_ip, last_dns_check FROM servers WHERE address = $1")
				.bind(address.to_string())
				.fetch_optional(&self.pool)
				.await?;

		let Some((resolved_ip, Some(checked_at))) = row else {
			return Ok(None);
		};

		Ok(Some(DnsEntry {
			resolved_ip: schema::parse_ip(&address.to_string(), resolved_ip)?,
			checked_at,
		}))
	}

	async fn store_dns(&self, address: &ServerAddress, entry: DnsEntry) -> Result<(), StoreError> {
		sqlx::query("UPDATE servers SET resolved_ip = $2, last_dns_check = $3 WHERE address = $1")
			.bind(address.to_string())
			.bind(entry.resolved_ip.map(|ip| ip.to_string()))
			.bind(entry.checked_at)
			.execute(&self.pool)
			.await?;

		Ok(())
	}

	async fn fingerprint_rows(&self) -> Result<Vec<FingerprintRow>, StoreError> {
		let rows: Vec<FingerprintSqlRow> = sqlx::query_as(
			"SELECT s.address, s.favicon_hash, s.resolved_ip, s.first_seen,
			latest.online AS players_online,
			(SELECT count(*) FROM server_snapshots c WHERE c.address = s.address) AS snapshot_count
			FROM servers s
			LEFT JOIN LATERAL (
				SELECT online FROM server_snapshots l WHERE l.address = s.address ORDER BY l.id DESC LIMIT 1
			) latest ON TRUE",
		)
		.fetch_all(&self.pool)
		.await?;

		rows.into_iter()
			.map(|row| {
				let address =
					ServerAddress::parse_with(&row.address, false).map_err(|e| StoreError::Corrupt {
						address: row.address.clone(),
						reason: e.to_string(),
					})?;
				Ok(FingerprintRow {
					resolved_ip: schema::parse_ip(&row.address, row.resolved_ip)?,
					address,
					favicon_hash: row.favicon_hash,
					players_online: row.players_online,
					first_seen: row.first_seen,
					snapshot_count: row.snapshot_count,
				})
			})
			.collect()
	}

	async fn load_identity_state(&self) -> Result<IdentityState, StoreError> {
		let query = format!("SELECT {SERVER_COLUMNS} FROM servers");
		let servers: Vec<ServerRow> = sqlx::query_as(&query)
			.fetch_all(&self.pool)
			.await?;
		let aliases: Vec<AliasRow> = sqlx::query_as(
			"SELECT alias_address, canonical_address, detection_method, confidence, created_at FROM server_aliases",
		)
		.fetch_all(&self.pool)
		.await?;

		let mut state = IdentityState::new();
		for row in servers {
			let record = ServerRecord::try_from(row)?;
			state.insert_record(record.address.clone(), record.status());
		}
		for row in aliases {
			state.insert_edge(AliasEdge::try_from(row)?);
		}

		Ok(state)
	}

	async fn apply_merge(&self, steps: &[MergeStep]) -> Result<Vec<StepOutcome>, StoreError> {
		let mut transaction = self.pool.begin().await?;

		sqlx::query("SELECT pg_advisory_xact_lock($1)")
			.bind(MERGE_LOCK_KEY)
			.execute(&mut *transaction)
			.await?;

		let mut outcomes = Vec::with_capacity(steps.len());

		for step in steps {
			sqlx::query("SAVEPOINT merge_step").execute(&mut *transaction).await?;

			match Self::apply_step(&mut *transaction, step).await? {
				Ok(()) => {
					sqlx::query("RELEASE SAVEPOINT merge_step")
						.execute(&mut *transaction)
						.await?;
					outcomes.push(StepOutcome::Applied);
				}
				Err(reason) => {
					sqlx::query("ROLLBACK TO SAVEPOINT merge_step")
						.execute(&mut *transaction)
						.await?;
					outcomes.push(StepOutcome::Rejected(reason));
				}
			}
		}

		transaction.commit().await?;
		Ok(outcomes)
	}

	async fn resolve_canonical(
		&self,
		address: &ServerAddress,
	) -> Result<Option<ServerAddress>, StoreError> {
		let row: Option<(Option<String>,)> =
			sqlx::query_as("SELECT canonical_of FROM servers WHERE address = $1")
				.bind(address.to_string())
				.fetch_optional(&self.pool)
				.await?;

		match row {
			None => Ok(None),
			Some((None,)) => Ok(Some(address.clone())),
			Some((Some(canonical),)) => ServerAddress::parse_with(&canonical, false)
				.map(Some)
				.map_err(|e| StoreError::Corrupt {
					address: address.to_string(),
					reason: e.to_string(),
				}),
		}
	}

	async fn aliases_of(&self, canonical: &ServerAddress) -> Result<Vec<AliasEdge>, StoreError> {
		let rows: Vec<AliasRow> = sqlx::query_as(
			"SELECT alias_address, canonical_address, detection_method, confidence, created_at
			FROM server_aliases WHERE canonical_address = $1
			ORDER BY confidence DESC, created_at DESC",
		)
		.bind(canonical.to_string())
		.fetch_all(&self.pool)
		.await?;

		let mut edges = rows.into_iter().map(AliasEdge::try_from).collect::<Result<Vec<_>, _>>()?;
		sort_aliases(&mut edges);
		Ok(edges)
	}
}
