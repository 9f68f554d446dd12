use rusqlite::{params, Connection, OptionalExtension};
use std::path::Path;

use crate::error::EngineError;
use crate::models::{SessionStatus, TokenStats};

const SCHEMA: &str = r#"
-- One row per search session. Derived from the JSON documents, which stay
-- authoritative; this index only powers listing and cost queries.
CREATE TABLE IF NOT EXISTS sessions (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL UNIQUE,
    date TEXT NOT NULL,
    prompt TEXT NOT NULL,
    slug TEXT NOT NULL,
    status TEXT NOT NULL DEFAULT 'running',
    ranking_mode TEXT NOT NULL,
    iterations INTEGER DEFAULT 0,
    winner_candidate TEXT,
    winner_score REAL,
    prompt_tokens INTEGER DEFAULT 0,
    completion_tokens INTEGER DEFAULT 0,
    wall_time_seconds REAL,
    created_at TEXT DEFAULT CURRENT_TIMESTAMP
);

-- One row per completed candidate image.
CREATE TABLE IF NOT EXISTS images (
    id INTEGER PRIMARY KEY AUTOINCREMENT,
    session_id TEXT NOT NULL,
    candidate_id TEXT NOT NULL,
    iteration INTEGER NOT NULL,
    path TEXT NOT NULL,
    width INTEGER,
    height INTEGER,
    file_size INTEGER,
    UNIQUE (session_id, candidate_id)
);

CREATE INDEX IF NOT EXISTS idx_sessions_date ON sessions(date);
CREATE INDEX IF NOT EXISTS idx_sessions_status ON sessions(status);
CREATE INDEX IF NOT EXISTS idx_images_session ON images(session_id);
"#;

/// One row of the session listing.
#[derive(Debug, Clone)]
pub struct SessionRow {
    pub session_id: String,
    pub date: String,
    pub prompt: String,
    pub slug: String,
    pub status: String,
    pub ranking_mode: String,
    pub iterations: i64,
    pub winner_candidate: Option<String>,
    pub winner_score: Option<f64>,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub wall_time_seconds: Option<f64>,
}

/// Filters for the session listing.
#[derive(Debug, Clone, Default)]
pub struct SessionFilter {
    pub limit: Option<i64>,
    pub status: Option<SessionStatus>,
    pub since_date: Option<String>,
    pub search: Option<String>,
}

/// Aggregated token usage across sessions.
#[derive(Debug, Clone)]
pub struct UsageSummary {
    pub sessions: i64,
    pub prompt_tokens: i64,
    pub completion_tokens: i64,
    pub by_day: Vec<(String, i64)>,
}

pub struct Database {
    conn: Connection,
}

impl Database {
    pub fn open(path: &Path) -> Result<Self, EngineError> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let conn = Connection::open(path)?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self { conn })
    }

    pub fn insert_session(
        &self,
        session_id: &str,
        date: &str,
        prompt: &str,
        slug: &str,
        ranking_mode: &str,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT OR IGNORE INTO sessions (session_id, date, prompt, slug, ranking_mode)
             VALUES (?1, ?2, ?3, ?4, ?5)",
            params![session_id, date, prompt, slug, ranking_mode],
        )?;
        Ok(())
    }

    pub fn update_progress(&self, session_id: &str, iterations: i64) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE sessions SET iterations = ?2 WHERE session_id = ?1",
            params![session_id, iterations],
        )?;
        Ok(())
    }

    #[allow(clippy::too_many_arguments)]
    pub fn complete_session(
        &self,
        session_id: &str,
        status: SessionStatus,
        winner_candidate: Option<&str>,
        winner_score: Option<f64>,
        tokens: &TokenStats,
        wall_time_seconds: f64,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "UPDATE sessions SET status = ?2, winner_candidate = ?3, winner_score = ?4,
                 prompt_tokens = ?5, completion_tokens = ?6, wall_time_seconds = ?7
             WHERE session_id = ?1",
            params![
                session_id,
                status.to_string(),
                winner_candidate,
                winner_score,
                tokens.total_prompt_tokens as i64,
                tokens.total_completion_tokens as i64,
                wall_time_seconds,
            ],
        )?;
        Ok(())
    }

    pub fn insert_image(
        &self,
        session_id: &str,
        candidate_id: &str,
        iteration: i64,
        path: &str,
        width: Option<i64>,
        height: Option<i64>,
        file_size: Option<i64>,
    ) -> Result<(), EngineError> {
        self.conn.execute(
            "INSERT OR REPLACE INTO images
                 (session_id, candidate_id, iteration, path, width, height, file_size)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![session_id, candidate_id, iteration, path, width, height, file_size],
        )?;
        Ok(())
    }

    pub fn get_session(&self, session_id: &str) -> Result<Option<SessionRow>, EngineError> {
        let row = self
            .conn
            .query_row(
                "SELECT session_id, date, prompt, slug, status, ranking_mode, iterations,
                        winner_candidate, winner_score, prompt_tokens, completion_tokens,
                        wall_time_seconds
                 FROM sessions WHERE session_id = ?1",
                params![session_id],
                Self::row_to_session,
            )
            .optional()?;
        Ok(row)
    }

    pub fn list_sessions(&self, filter: &SessionFilter) -> Result<Vec<SessionRow>, EngineError> {
        let mut sql = String::from(
            "SELECT session_id, date, prompt, slug, status, ranking_mode, iterations,
                    winner_candidate, winner_score, prompt_tokens, completion_tokens,
                    wall_time_seconds
             FROM sessions WHERE 1=1",
        );
        let mut args: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();

        if let Some(status) = filter.status {
            sql.push_str(" AND status = ?");
            args.push(Box::new(status.to_string()));
        }
        if let Some(since) = &filter.since_date {
            sql.push_str(" AND date >= ?");
            args.push(Box::new(since.clone()));
        }
        if let Some(search) = &filter.search {
            sql.push_str(" AND prompt LIKE ?");
            args.push(Box::new(format!("%{search}%")));
        }

        sql.push_str(" ORDER BY date DESC, session_id DESC");
        sql.push_str(" LIMIT ?");
        args.push(Box::new(filter.limit.unwrap_or(20)));

        let mut stmt = self.conn.prepare(&sql)?;
        let params_ref: Vec<&dyn rusqlite::ToSql> = args.iter().map(|b| b.as_ref()).collect();
        let rows = stmt
            .query_map(params_ref.as_slice(), Self::row_to_session)?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn image_paths(&self, session_id: &str) -> Result<Vec<(String, String)>, EngineError> {
        let mut stmt = self.conn.prepare(
            "SELECT candidate_id, path FROM images WHERE session_id = ?1
             ORDER BY iteration, candidate_id",
        )?;
        let rows = stmt
            .query_map(params![session_id], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(rows)
    }

    pub fn usage_summary(&self) -> Result<UsageSummary, EngineError> {
        let (sessions, prompt_tokens, completion_tokens) = self.conn.query_row(
            "SELECT COUNT(*), COALESCE(SUM(prompt_tokens), 0),
                    COALESCE(SUM(completion_tokens), 0)
             FROM sessions",
            [],
            |row| {
                Ok((
                    row.get::<_, i64>(0)?,
                    row.get::<_, i64>(1)?,
                    row.get::<_, i64>(2)?,
                ))
            },
        )?;

        let mut stmt = self.conn.prepare(
            "SELECT date, SUM(prompt_tokens + completion_tokens) FROM sessions
             GROUP BY date ORDER BY date DESC LIMIT 30",
        )?;
        let by_day = stmt
            .query_map([], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?
            .collect::<Result<Vec<_>, _>>()?;

        Ok(UsageSummary {
            sessions,
            prompt_tokens,
            completion_tokens,
            by_day,
        })
    }

    fn row_to_session(row: &rusqlite::Row<'_>) -> rusqlite::Result<SessionRow> {
        Ok(SessionRow {
            session_id: row.get(0)?,
            date: row.get(1)?,
            prompt: row.get(2)?,
            slug: row.get(3)?,
            status: row.get(4)?,
            ranking_mode: row.get(5)?,
            iterations: row.get(6)?,
            winner_candidate: row.get(7)?,
            winner_score: row.get(8)?,
            prompt_tokens: row.get(9)?,
            completion_tokens: row.get(10)?,
            wall_time_seconds: row.get(11)?,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn open_temp() -> (tempfile::TempDir, Database) {
        let dir = tempfile::tempdir().unwrap();
        let db = Database::open(&dir.path().join("index.sqlite")).unwrap();
        (dir, db)
    }

    #[test]
    fn session_lifecycle_round_trips() {
        let (_dir, db) = open_temp();
        db.insert_session("ses-120000", "2026-08-01", "a mountain", "a-mountain", "pairwise")
            .unwrap();
        db.update_progress("ses-120000", 2).unwrap();

        let mut tokens = TokenStats::default();
        tokens.record(
            "expand",
            crate::models::TokenUsage {
                prompt_tokens: 100,
                completion_tokens: 50,
            },
        );
        db.complete_session(
            "ses-120000",
            SessionStatus::Completed,
            Some("iter1-cand0"),
            Some(1.0),
            &tokens,
            12.5,
        )
        .unwrap();

        let row = db.get_session("ses-120000").unwrap().unwrap();
        assert_eq!(row.status, "completed");
        assert_eq!(row.iterations, 2);
        assert_eq!(row.winner_candidate.as_deref(), Some("iter1-cand0"));
        assert_eq!(row.prompt_tokens, 100);
    }

    #[test]
    fn listing_filters_by_status_and_search() {
        let (_dir, db) = open_temp();
        db.insert_session("ses-1", "2026-08-01", "a mountain lake", "a-mountain-lake", "pairwise")
            .unwrap();
        db.insert_session("ses-2", "2026-08-01", "a desert road", "a-desert-road", "pairwise")
            .unwrap();
        db.complete_session(
            "ses-2",
            SessionStatus::Failed,
            None,
            None,
            &TokenStats::default(),
            1.0,
        )
        .unwrap();

        let running = db
            .list_sessions(&SessionFilter {
                status: Some(SessionStatus::Running),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(running.len(), 1);
        assert_eq!(running[0].session_id, "ses-1");

        let mountains = db
            .list_sessions(&SessionFilter {
                search: Some("mountain".into()),
                ..Default::default()
            })
            .unwrap();
        assert_eq!(mountains.len(), 1);
    }

    #[test]
    fn image_rows_are_unique_per_candidate() {
        let (_dir, db) = open_temp();
        db.insert_image("ses-1", "iter0-cand0", 0, "/a.png", Some(32), Some(32), Some(100))
            .unwrap();
        db.insert_image("ses-1", "iter0-cand0", 0, "/b.png", Some(32), Some(32), Some(100))
            .unwrap();

        let paths = db.image_paths("ses-1").unwrap();
        assert_eq!(paths.len(), 1);
        assert_eq!(paths[0].1, "/b.png");
    }

    #[test]
    fn usage_summary_aggregates_tokens() {
        let (_dir, db) = open_temp();
        db.insert_session("ses-1", "2026-08-01", "p", "p", "pairwise").unwrap();
        let mut tokens = TokenStats::default();
        tokens.record(
            "compare",
            crate::models::TokenUsage {
                prompt_tokens: 10,
                completion_tokens: 20,
            },
        );
        db.complete_session("ses-1", SessionStatus::Completed, None, None, &tokens, 1.0)
            .unwrap();

        let summary = db.usage_summary().unwrap();
        assert_eq!(summary.sessions, 1);
        assert_eq!(summary.prompt_tokens, 10);
        assert_eq!(summary.by_day[0].1, 30);
    }
}
