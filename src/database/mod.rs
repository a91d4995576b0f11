pub mod models;


use anyhow::Result;
use chrono::{DateTime, Duration, Utc};
use rusqlite::{params, params_from_iter, Connection, OptionalExtension, Row};
use std::path::Path;
use std::sync::{Arc, Mutex};
use uuid::Uuid;

pub use models::*;

const EPISODE_COLS: &str =
    "id, podcast_id, guid, title, audio_url, published_at, duration, status, transcript, last_error";

const CLIP_COLS: &str = "id, episode_id, start_time, end_time, duration, transcript, \
     relevance_score, reasoning, summary, digest_id";

const DIGEST_COLS: &str = "id, user_id, status, podcast_id, episode_ids, narrator_script, \
     audio_url, duration, is_public, share_id, created_at, updated_at";

const JOB_COLS: &str = "id, queue, name, dedup_key, payload, status, attempts_made, \
     max_attempts, backoff_delay_ms, progress, last_error, run_at, created_at, duration_ms";

/// What happened to a job after a failed attempt.
#[derive(Debug, Clone, PartialEq)]
pub enum JobDisposition {
    /// Requeued; will not run before the given time.
    Retried(DateTime<Utc>),
    /// Attempts exhausted or error was fatal; surfaced as failed.
    Failed,
}

/// Options for enqueuing a job.
#[derive(Debug, Clone, Default)]
pub struct EnqueueOptions {
    /// Dedup key: if a waiting/active job in the queue carries the same key,
    /// the enqueue is a no-op.
    pub job_id: Option<String>,
    pub max_attempts: i64,
    pub backoff_delay_ms: i64,
}

pub struct Database {
    conn: Arc<Mutex<Connection>>,
}

impl Database {
    pub fn new(db_path: &Path) -> Result<Self> {
        let conn = Connection::open(db_path)?;

        // WAL for concurrent reads while a worker holds a write
        conn.execute_batch(
            "
            PRAGMA journal_mode=WAL;
            PRAGMA synchronous=NORMAL;
            PRAGMA foreign_keys=ON;
            PRAGMA cache_size=-65536;
            PRAGMA temp_store=MEMORY;
        ",
        )?;

        let db = Self {
            conn: Arc::new(Mutex::new(conn)),
        };

        db.init_schema()?;

        Ok(db)
    }

    fn init_schema(&self) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS users (
                id TEXT PRIMARY KEY,
                email TEXT NOT NULL UNIQUE,
                name TEXT,
                interests TEXT NOT NULL DEFAULT '[]',
                frequency TEXT NOT NULL DEFAULT 'daily',
                digest_duration_minutes INTEGER NOT NULL DEFAULT 7,
                created_at TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS podcasts (
                id TEXT PRIMARY KEY,
                rss_url TEXT NOT NULL UNIQUE,
                title TEXT NOT NULL,
                author TEXT,
                image_url TEXT,
                last_checked_at TEXT
            );

            CREATE TABLE IF NOT EXISTS subscriptions (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                podcast_id TEXT NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
                created_at TEXT NOT NULL,
                UNIQUE(user_id, podcast_id)
            );

            CREATE TABLE IF NOT EXISTS episodes (
                id TEXT PRIMARY KEY,
                podcast_id TEXT NOT NULL REFERENCES podcasts(id) ON DELETE CASCADE,
                guid TEXT NOT NULL,
                title TEXT NOT NULL,
                audio_url TEXT NOT NULL,
                published_at TEXT NOT NULL,
                duration REAL,
                status TEXT NOT NULL DEFAULT 'pending',
                transcript TEXT,
                last_error TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL,
                UNIQUE(podcast_id, guid)
            );

            CREATE INDEX IF NOT EXISTS idx_episodes_podcast_published
                ON episodes(podcast_id, published_at DESC);
            CREATE INDEX IF NOT EXISTS idx_episodes_status ON episodes(status);

            CREATE TABLE IF NOT EXISTS clips (
                id TEXT PRIMARY KEY,
                episode_id TEXT NOT NULL REFERENCES episodes(id) ON DELETE CASCADE,
                start_time REAL NOT NULL,
                end_time REAL NOT NULL,
                duration REAL NOT NULL,
                transcript TEXT NOT NULL,
                relevance_score REAL NOT NULL,
                reasoning TEXT NOT NULL DEFAULT '',
                summary TEXT NOT NULL DEFAULT '',
                digest_id TEXT,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_clips_episode ON clips(episode_id);
            CREATE INDEX IF NOT EXISTS idx_clips_score ON clips(relevance_score DESC);

            CREATE TABLE IF NOT EXISTS digests (
                id TEXT PRIMARY KEY,
                user_id TEXT NOT NULL REFERENCES users(id) ON DELETE CASCADE,
                status TEXT NOT NULL DEFAULT 'pending',
                podcast_id TEXT REFERENCES podcasts(id),
                episode_ids TEXT NOT NULL DEFAULT '[]',
                narrator_script TEXT,
                audio_url TEXT,
                duration REAL,
                is_public INTEGER NOT NULL DEFAULT 0,
                share_id TEXT,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_digests_user ON digests(user_id);
            CREATE INDEX IF NOT EXISTS idx_digests_status ON digests(status);

            CREATE TABLE IF NOT EXISTS digest_clips (
                id TEXT PRIMARY KEY,
                digest_id TEXT NOT NULL REFERENCES digests(id) ON DELETE CASCADE,
                clip_id TEXT NOT NULL REFERENCES clips(id) ON DELETE CASCADE,
                position INTEGER NOT NULL,
                UNIQUE(digest_id, clip_id),
                UNIQUE(digest_id, position)
            );

            CREATE TABLE IF NOT EXISTS jobs (
                id TEXT PRIMARY KEY,
                queue TEXT NOT NULL,
                name TEXT NOT NULL,
                dedup_key TEXT,
                payload TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'waiting',
                attempts_made INTEGER NOT NULL DEFAULT 0,
                max_attempts INTEGER NOT NULL DEFAULT 1,
                backoff_delay_ms INTEGER NOT NULL DEFAULT 5000,
                progress INTEGER NOT NULL DEFAULT 0,
                last_error TEXT,
                run_at TEXT NOT NULL,
                started_at TEXT,
                duration_ms INTEGER,
                created_at TEXT NOT NULL,
                updated_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_jobs_queue_status ON jobs(queue, status, run_at);
            CREATE UNIQUE INDEX IF NOT EXISTS idx_jobs_dedup
                ON jobs(queue, dedup_key)
                WHERE dedup_key IS NOT NULL AND status IN ('waiting', 'active');
        "#,
        )?;

        Ok(())
    }

    // ── Users ──────────────────────────────────────────────────────────────

    pub fn create_user(
        &self,
        email: &str,
        name: Option<&str>,
        interests: &[String],
        frequency: Frequency,
        digest_duration_minutes: i64,
    ) -> Result<User> {
        let conn = self.conn.lock().unwrap();
        let user = User {
            id: Uuid::new_v4().to_string(),
            email: email.to_string(),
            name: name.map(|s| s.to_string()),
            interests: interests.to_vec(),
            frequency,
            digest_duration_minutes,
            created_at: Utc::now(),
        };
        conn.execute(
            "INSERT INTO users (id, email, name, interests, frequency, digest_duration_minutes, created_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
            params![
                user.id,
                user.email,
                user.name,
                serde_json::to_string(&user.interests)?,
                user.frequency.as_str(),
                user.digest_duration_minutes,
                user.created_at,
            ],
        )?;
        Ok(user)
    }

    pub fn get_user(&self, id: &str) -> Result<Option<User>> {
        let conn = self.conn.lock().unwrap();
        let user = conn
            .query_row(
                "SELECT id, email, name, interests, frequency, digest_duration_minutes, created_at
                 FROM users WHERE id = ?1",
                params![id],
                |row| {
                    Ok(User {
                        id: row.get(0)?,
                        email: row.get(1)?,
                        name: row.get(2)?,
                        interests: parse_json_list(row.get::<_, String>(3)?),
                        frequency: row.get::<_, String>(4)?.into(),
                        digest_duration_minutes: row.get(5)?,
                        created_at: row.get(6)?,
                    })
                },
            )
            .optional()?;
        Ok(user)
    }

    // ── Podcasts ───────────────────────────────────────────────────────────

    pub fn create_podcast(
        &self,
        rss_url: &str,
        title: &str,
        author: Option<&str>,
        image_url: Option<&str>,
    ) -> Result<Podcast> {
        let conn = self.conn.lock().unwrap();
        let podcast = Podcast {
            id: Uuid::new_v4().to_string(),
            rss_url: rss_url.to_string(),
            title: title.to_string(),
            author: author.map(|s| s.to_string()),
            image_url: image_url.map(|s| s.to_string()),
            last_checked_at: None,
        };
        conn.execute(
            "INSERT INTO podcasts (id, rss_url, title, author, image_url) VALUES (?1, ?2, ?3, ?4, ?5)",
            params![
                podcast.id,
                podcast.rss_url,
                podcast.title,
                podcast.author,
                podcast.image_url
            ],
        )?;
        Ok(podcast)
    }

    pub fn get_podcast(&self, id: &str) -> Result<Option<Podcast>> {
        let conn = self.conn.lock().unwrap();
        let podcast = conn
            .query_row(
                "SELECT id, rss_url, title, author, image_url, last_checked_at
                 FROM podcasts WHERE id = ?1",
                params![id],
                |row| {
                    Ok(Podcast {
                        id: row.get(0)?,
                        rss_url: row.get(1)?,
                        title: row.get(2)?,
                        author: row.get(3)?,
                        image_url: row.get(4)?,
                        last_checked_at: row.get(5)?,
                    })
                },
            )
            .optional()?;
        Ok(podcast)
    }

    // ── Subscriptions ──────────────────────────────────────────────────────

    pub fn subscribe(&self, user_id: &str, podcast_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "INSERT OR IGNORE INTO subscriptions (id, user_id, podcast_id, created_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![Uuid::new_v4().to_string(), user_id, podcast_id, Utc::now()],
        )?;
        Ok(())
    }

    pub fn unsubscribe(&self, user_id: &str, podcast_id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "DELETE FROM subscriptions WHERE user_id = ?1 AND podcast_id = ?2",
            params![user_id, podcast_id],
        )?;
        Ok(())
    }

    pub fn subscribed_podcast_ids(&self, user_id: &str) -> Result<Vec<String>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT podcast_id FROM subscriptions WHERE user_id = ?1")?;
        let ids = stmt
            .query_map(params![user_id], |row| row.get(0))?
            .collect::<rusqlite::Result<Vec<String>>>()?;
        Ok(ids)
    }

    // ── Episodes ───────────────────────────────────────────────────────────

    /// Insert an episode or refresh its mutable feed fields; returns
    /// `(episode, is_new)`.
    pub fn upsert_episode(
        &self,
        podcast_id: &str,
        guid: &str,
        title: &str,
        audio_url: &str,
        published_at: DateTime<Utc>,
        duration: Option<Seconds>,
    ) -> Result<(Episode, bool)> {
        let conn = self.conn.lock().unwrap();
        let existing: Option<String> = conn
            .query_row(
                "SELECT id FROM episodes WHERE podcast_id = ?1 AND guid = ?2",
                params![podcast_id, guid],
                |row| row.get(0),
            )
            .optional()?;

        let now = Utc::now();
        let (id, is_new) = match existing {
            Some(id) => {
                conn.execute(
                    "UPDATE episodes SET title = ?2, audio_url = ?3, published_at = ?4,
                         duration = COALESCE(?5, duration), updated_at = ?6
                     WHERE id = ?1",
                    params![id, title, audio_url, published_at, duration, now],
                )?;
                (id, false)
            }
            None => {
                let id = Uuid::new_v4().to_string();
                conn.execute(
                    "INSERT INTO episodes (id, podcast_id, guid, title, audio_url, published_at,
                         duration, status, created_at, updated_at)
                     VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, 'pending', ?8, ?8)",
                    params![id, podcast_id, guid, title, audio_url, published_at, duration, now],
                )?;
                (id, true)
            }
        };

        let episode = conn.query_row(
            &format!("SELECT {EPISODE_COLS} FROM episodes WHERE id = ?1"),
            params![id],
            map_episode,
        )?;
        Ok((episode, is_new))
    }

    pub fn get_episode(&self, id: &str) -> Result<Option<Episode>> {
        let conn = self.conn.lock().unwrap();
        let episode = conn
            .query_row(
                &format!("SELECT {EPISODE_COLS} FROM episodes WHERE id = ?1"),
                params![id],
                map_episode,
            )
            .optional()?;
        Ok(episode)
    }

    pub fn get_episodes_by_ids(&self, ids: &[String]) -> Result<Vec<Episode>> {
        if ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = placeholders(ids.len());
        let mut stmt = conn.prepare(&format!(
            "SELECT {EPISODE_COLS} FROM episodes WHERE id IN ({placeholders})"
        ))?;
        let episodes = stmt
            .query_map(params_from_iter(ids.iter()), map_episode)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(episodes)
    }

    /// Episodes from the given podcasts published at or after `since`.
    pub fn recent_episodes(
        &self,
        podcast_ids: &[String],
        since: DateTime<Utc>,
    ) -> Result<Vec<Episode>> {
        if podcast_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = placeholders(podcast_ids.len());
        let mut stmt = conn.prepare(&format!(
            "SELECT {EPISODE_COLS} FROM episodes
             WHERE podcast_id IN ({placeholders}) AND published_at >= ?{}
             ORDER BY published_at DESC",
            podcast_ids.len() + 1
        ))?;
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = podcast_ids
            .iter()
            .map(|id| Box::new(id.clone()) as Box<dyn rusqlite::ToSql>)
            .collect();
        values.push(Box::new(since));
        let episodes = stmt
            .query_map(params_from_iter(values.iter().map(|v| v.as_ref())), map_episode)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(episodes)
    }

    /// Atomically move an episode from any of `from` to `to`.
    ///
    /// Returns false (and changes nothing) if the current status is not in
    /// `from` — the caller lost the race.
    pub fn transition_episode(
        &self,
        id: &str,
        from: &[EpisodeStatus],
        to: EpisodeStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let status_list = status_list(from.iter().map(|s| s.as_str()));
        let changed = conn.execute(
            &format!(
                "UPDATE episodes SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN ({status_list})"
            ),
            params![id, to.as_str(), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_episode_failed(&self, id: &str, error: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET status = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, error, Utc::now()],
        )?;
        Ok(())
    }

    /// Persist the merged transcript, set duration, and mark transcribed.
    pub fn save_transcript(&self, id: &str, transcript: &Transcript) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE episodes SET transcript = ?2, duration = ?3, status = 'transcribed',
                 last_error = NULL, updated_at = ?4
             WHERE id = ?1",
            params![
                id,
                serde_json::to_string(transcript)?,
                transcript.duration,
                Utc::now()
            ],
        )?;
        Ok(())
    }

    // ── Clips ──────────────────────────────────────────────────────────────

    /// Replace the episode's clip set wholesale.
    pub fn replace_clips(&self, episode_id: &str, clips: &[NewClip]) -> Result<Vec<Clip>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute("DELETE FROM clips WHERE episode_id = ?1", params![episode_id])?;

        let now = Utc::now();
        let mut inserted = Vec::with_capacity(clips.len());
        for clip in clips {
            let row = Clip {
                id: Uuid::new_v4().to_string(),
                episode_id: episode_id.to_string(),
                start_time: clip.start_time,
                end_time: clip.end_time,
                duration: clip.end_time - clip.start_time,
                transcript: clip.transcript.clone(),
                relevance_score: clip.relevance_score,
                reasoning: clip.reasoning.clone(),
                summary: clip.summary.clone(),
                digest_id: None,
            };
            tx.execute(
                "INSERT INTO clips (id, episode_id, start_time, end_time, duration, transcript,
                     relevance_score, reasoning, summary, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)",
                params![
                    row.id,
                    row.episode_id,
                    row.start_time,
                    row.end_time,
                    row.duration,
                    row.transcript,
                    row.relevance_score,
                    row.reasoning,
                    row.summary,
                    now,
                ],
            )?;
            inserted.push(row);
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn get_clips_for_episode(&self, episode_id: &str) -> Result<Vec<Clip>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(&format!(
            "SELECT {CLIP_COLS} FROM clips WHERE episode_id = ?1 ORDER BY relevance_score DESC"
        ))?;
        let clips = stmt
            .query_map(params![episode_id], map_clip)?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clips)
    }

    /// Clip candidates across episodes, highest relevance first, with episode
    /// and podcast titles eagerly joined.
    pub fn get_clips_for_episodes(&self, episode_ids: &[String]) -> Result<Vec<ClipWithEpisode>> {
        if episode_ids.is_empty() {
            return Ok(Vec::new());
        }
        let conn = self.conn.lock().unwrap();
        let placeholders = placeholders(episode_ids.len());
        let mut stmt = conn.prepare(&format!(
            "SELECT c.id, c.episode_id, c.start_time, c.end_time, c.duration, c.transcript,
                    c.relevance_score, c.reasoning, c.summary, c.digest_id,
                    e.title, p.title, e.audio_url
             FROM clips c
             JOIN episodes e ON e.id = c.episode_id
             JOIN podcasts p ON p.id = e.podcast_id
             WHERE c.episode_id IN ({placeholders})
             ORDER BY c.relevance_score DESC"
        ))?;
        let clips = stmt
            .query_map(params_from_iter(episode_ids.iter()), |row| {
                Ok(ClipWithEpisode {
                    clip: map_clip(row)?,
                    episode_title: row.get(10)?,
                    podcast_title: row.get(11)?,
                    episode_audio_url: row.get(12)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(clips)
    }

    /// Record which digest adopted the given clips.
    pub fn mark_clips_adopted(&self, digest_id: &str, clip_ids: &[String]) -> Result<()> {
        if clip_ids.is_empty() {
            return Ok(());
        }
        let conn = self.conn.lock().unwrap();
        let mut values: Vec<Box<dyn rusqlite::ToSql>> = vec![Box::new(digest_id.to_string())];
        values.extend(
            clip_ids
                .iter()
                .map(|id| Box::new(id.clone()) as Box<dyn rusqlite::ToSql>),
        );
        conn.execute(
            &format!(
                "UPDATE clips SET digest_id = ?1 WHERE id IN ({})",
                shifted_placeholders(clip_ids.len(), 2)
            ),
            params_from_iter(values.iter().map(|v| v.as_ref())),
        )?;
        Ok(())
    }

    // ── Digests ────────────────────────────────────────────────────────────

    pub fn create_digest(
        &self,
        user_id: &str,
        status: DigestStatus,
        podcast_id: Option<&str>,
        episode_ids: &[String],
    ) -> Result<Digest> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let digest = Digest {
            id: Uuid::new_v4().to_string(),
            user_id: user_id.to_string(),
            status,
            podcast_id: podcast_id.map(|s| s.to_string()),
            episode_ids: episode_ids.to_vec(),
            narrator_script: None,
            audio_url: None,
            duration: None,
            is_public: false,
            share_id: None,
            created_at: now,
            updated_at: now,
        };
        conn.execute(
            "INSERT INTO digests (id, user_id, status, podcast_id, episode_ids, is_public,
                 created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 0, ?6, ?6)",
            params![
                digest.id,
                digest.user_id,
                digest.status.as_str(),
                digest.podcast_id,
                serde_json::to_string(&digest.episode_ids)?,
                now,
            ],
        )?;
        Ok(digest)
    }

    pub fn get_digest(&self, id: &str) -> Result<Option<Digest>> {
        let conn = self.conn.lock().unwrap();
        let digest = conn
            .query_row(
                &format!("SELECT {DIGEST_COLS} FROM digests WHERE id = ?1"),
                params![id],
                map_digest,
            )
            .optional()?;
        Ok(digest)
    }

    /// Conditional digest status transition; false means the caller lost.
    pub fn transition_digest(
        &self,
        id: &str,
        from: &[DigestStatus],
        to: DigestStatus,
    ) -> Result<bool> {
        let conn = self.conn.lock().unwrap();
        let status_list = status_list(from.iter().map(|s| s.as_str()));
        let changed = conn.execute(
            &format!(
                "UPDATE digests SET status = ?2, updated_at = ?3
                 WHERE id = ?1 AND status IN ({status_list})"
            ),
            params![id, to.as_str(), Utc::now()],
        )?;
        Ok(changed > 0)
    }

    pub fn set_digest_status(&self, id: &str, to: DigestStatus) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE digests SET status = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, to.as_str(), Utc::now()],
        )?;
        Ok(())
    }

    pub fn set_digest_script(&self, id: &str, script_json: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE digests SET narrator_script = ?2, updated_at = ?3 WHERE id = ?1",
            params![id, script_json, Utc::now()],
        )?;
        Ok(())
    }

    pub fn clear_digest_script(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE digests SET narrator_script = NULL, updated_at = ?2 WHERE id = ?1",
            params![id, Utc::now()],
        )?;
        Ok(())
    }

    /// Publish: record the artifact and move to `ready`.
    pub fn set_digest_ready(&self, id: &str, audio_url: &str, duration: Seconds) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE digests SET status = 'ready', audio_url = ?2, duration = ?3, updated_at = ?4
             WHERE id = ?1",
            params![id, audio_url, duration, Utc::now()],
        )?;
        Ok(())
    }

    // ── Digest clips ───────────────────────────────────────────────────────

    /// Replace the digest's clip list; positions are assigned 0..N-1 in the
    /// order given.
    pub fn replace_digest_clips(
        &self,
        digest_id: &str,
        clip_ids: &[String],
    ) -> Result<Vec<DigestClip>> {
        let mut conn = self.conn.lock().unwrap();
        let tx = conn.transaction()?;
        tx.execute(
            "DELETE FROM digest_clips WHERE digest_id = ?1",
            params![digest_id],
        )?;
        let mut inserted = Vec::with_capacity(clip_ids.len());
        for (position, clip_id) in clip_ids.iter().enumerate() {
            let row = DigestClip {
                id: Uuid::new_v4().to_string(),
                digest_id: digest_id.to_string(),
                clip_id: clip_id.clone(),
                position: position as i64,
            };
            tx.execute(
                "INSERT INTO digest_clips (id, digest_id, clip_id, position) VALUES (?1, ?2, ?3, ?4)",
                params![row.id, row.digest_id, row.clip_id, row.position],
            )?;
            inserted.push(row);
        }
        tx.commit()?;
        Ok(inserted)
    }

    pub fn count_digest_clips(&self, digest_id: &str) -> Result<i64> {
        let conn = self.conn.lock().unwrap();
        let count = conn.query_row(
            "SELECT COUNT(*) FROM digest_clips WHERE digest_id = ?1",
            params![digest_id],
            |row| row.get(0),
        )?;
        Ok(count)
    }

    /// Ordered digest clips eagerly joined through clip → episode → podcast.
    pub fn get_digest_clip_details(&self, digest_id: &str) -> Result<Vec<DigestClipDetail>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT dc.position,
                    c.id, c.episode_id, c.start_time, c.end_time, c.duration, c.transcript,
                    c.relevance_score, c.reasoning, c.summary, c.digest_id,
                    e.title, e.audio_url, p.title
             FROM digest_clips dc
             JOIN clips c ON c.id = dc.clip_id
             JOIN episodes e ON e.id = c.episode_id
             JOIN podcasts p ON p.id = e.podcast_id
             WHERE dc.digest_id = ?1
             ORDER BY dc.position ASC",
        )?;
        let details = stmt
            .query_map(params![digest_id], |row| {
                Ok(DigestClipDetail {
                    position: row.get(0)?,
                    clip: Clip {
                        id: row.get(1)?,
                        episode_id: row.get(2)?,
                        start_time: row.get(3)?,
                        end_time: row.get(4)?,
                        duration: row.get(5)?,
                        transcript: row.get(6)?,
                        relevance_score: row.get(7)?,
                        reasoning: row.get(8)?,
                        summary: row.get(9)?,
                        digest_id: row.get(10)?,
                    },
                    episode_title: row.get(11)?,
                    episode_audio_url: row.get(12)?,
                    podcast_title: row.get(13)?,
                })
            })?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(details)
    }

    // ── Jobs ───────────────────────────────────────────────────────────────

    /// Enqueue a job unless an active job with the same dedup key exists.
    ///
    /// Returns the new job id, or None when deduplicated.
    pub fn enqueue_job(
        &self,
        queue: &str,
        name: &str,
        payload: &serde_json::Value,
        options: &EnqueueOptions,
    ) -> Result<Option<String>> {
        let conn = self.conn.lock().unwrap();
        if let Some(key) = &options.job_id {
            let existing: Option<String> = conn
                .query_row(
                    "SELECT id FROM jobs
                     WHERE queue = ?1 AND dedup_key = ?2 AND status IN ('waiting', 'active')",
                    params![queue, key],
                    |row| row.get(0),
                )
                .optional()?;
            if existing.is_some() {
                return Ok(None);
            }
        }

        let id = Uuid::new_v4().to_string();
        let now = Utc::now();
        conn.execute(
            "INSERT INTO jobs (id, queue, name, dedup_key, payload, status, max_attempts,
                 backoff_delay_ms, run_at, created_at, updated_at)
             VALUES (?1, ?2, ?3, ?4, ?5, 'waiting', ?6, ?7, ?8, ?8, ?8)",
            params![
                id,
                queue,
                name,
                options.job_id,
                serde_json::to_string(payload)?,
                options.max_attempts.max(1),
                options.backoff_delay_ms.max(0),
                now,
            ],
        )?;
        Ok(Some(id))
    }

    /// Pop the oldest due waiting job in the queue, marking it active.
    ///
    /// The select and the status flip happen under one connection lock, so
    /// in-process workers never claim the same job twice.
    pub fn claim_next_job(&self, queue: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let job = conn
            .query_row(
                &format!(
                    "SELECT {JOB_COLS} FROM jobs
                     WHERE queue = ?1 AND status = 'waiting' AND run_at <= ?2
                     ORDER BY created_at ASC LIMIT 1"
                ),
                params![queue, now],
                map_job,
            )
            .optional()?;

        if let Some(job) = &job {
            conn.execute(
                "UPDATE jobs SET status = 'active', attempts_made = attempts_made + 1,
                     started_at = ?2, updated_at = ?2
                 WHERE id = ?1",
                params![job.id, now],
            )?;
        }
        Ok(job.map(|mut j| {
            j.status = JobStatus::Active;
            j.attempts_made += 1;
            j
        }))
    }

    pub fn get_job(&self, id: &str) -> Result<Option<JobRecord>> {
        let conn = self.conn.lock().unwrap();
        let job = conn
            .query_row(
                &format!("SELECT {JOB_COLS} FROM jobs WHERE id = ?1"),
                params![id],
                map_job,
            )
            .optional()?;
        Ok(job)
    }

    pub fn complete_job(&self, id: &str) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        let now = Utc::now();
        let started_at: Option<DateTime<Utc>> = conn.query_row(
            "SELECT started_at FROM jobs WHERE id = ?1",
            params![id],
            |row| row.get(0),
        )?;
        let duration_ms = started_at.map(|s| (now - s).num_milliseconds());
        conn.execute(
            "UPDATE jobs SET status = 'completed', progress = 100, duration_ms = ?2,
                 updated_at = ?3
             WHERE id = ?1",
            params![id, duration_ms, now],
        )?;
        Ok(())
    }

    /// Record a failed attempt; requeue with exponential backoff while
    /// attempts remain and the error is retryable.
    ///
    /// `retry_limit` is an error-kind ceiling on retries that cuts below the
    /// job's own attempt budget: with `Some(1)`, the second failure is final
    /// no matter how many attempts the job was enqueued with.
    pub fn fail_job_attempt(
        &self,
        id: &str,
        error: &str,
        retryable: bool,
        retry_limit: Option<i64>,
    ) -> Result<JobDisposition> {
        let conn = self.conn.lock().unwrap();
        let (attempts_made, max_attempts, backoff_delay_ms): (i64, i64, i64) = conn.query_row(
            "SELECT attempts_made, max_attempts, backoff_delay_ms FROM jobs WHERE id = ?1",
            params![id],
            |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
        )?;

        let now = Utc::now();
        let retries_used = attempts_made - 1;
        let within_kind_limit = retry_limit.map_or(true, |limit| retries_used < limit);
        if retryable && within_kind_limit && attempts_made < max_attempts {
            let delay_ms = backoff_delay_ms * (1 << (attempts_made - 1).clamp(0, 20));
            let run_at = now + Duration::milliseconds(delay_ms);
            conn.execute(
                "UPDATE jobs SET status = 'waiting', last_error = ?2, run_at = ?3, updated_at = ?4
                 WHERE id = ?1",
                params![id, error, run_at, now],
            )?;
            Ok(JobDisposition::Retried(run_at))
        } else {
            conn.execute(
                "UPDATE jobs SET status = 'failed', last_error = ?2, updated_at = ?3 WHERE id = ?1",
                params![id, error, now],
            )?;
            Ok(JobDisposition::Failed)
        }
    }

    pub fn update_job_progress(&self, id: &str, progress: i64) -> Result<()> {
        let conn = self.conn.lock().unwrap();
        conn.execute(
            "UPDATE jobs SET progress = MAX(progress, ?2), updated_at = ?3 WHERE id = ?1",
            params![id, progress.clamp(0, 100), Utc::now()],
        )?;
        Ok(())
    }

    /// Requeue jobs left active by a crashed worker. Run once at boot.
    pub fn reset_stuck_jobs(&self) -> Result<usize> {
        let conn = self.conn.lock().unwrap();
        let changed = conn.execute(
            "UPDATE jobs SET status = 'waiting', updated_at = ?1 WHERE status = 'active'",
            params![Utc::now()],
        )?;
        Ok(changed)
    }

    /// Per-queue counts by status, for the status command.
    pub fn queue_counts(&self) -> Result<Vec<(String, String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt = conn.prepare(
            "SELECT queue, status, COUNT(*) FROM jobs GROUP BY queue, status ORDER BY queue",
        )?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }

    /// Episode counts by status, for the status command.
    pub fn episode_status_counts(&self) -> Result<Vec<(String, i64)>> {
        let conn = self.conn.lock().unwrap();
        let mut stmt =
            conn.prepare("SELECT status, COUNT(*) FROM episodes GROUP BY status ORDER BY status")?;
        let counts = stmt
            .query_map([], |row| Ok((row.get(0)?, row.get(1)?)))?
            .collect::<rusqlite::Result<Vec<_>>>()?;
        Ok(counts)
    }
}

// ── Row mapping ────────────────────────────────────────────────────────────

fn map_episode(row: &Row<'_>) -> rusqlite::Result<Episode> {
    let transcript_json: Option<String> = row.get(8)?;
    let transcript = transcript_json.and_then(|json| match serde_json::from_str(&json) {
        Ok(t) => Some(t),
        Err(e) => {
            log::warn!("Discarding unparsable transcript document: {}", e);
            None
        }
    });

    Ok(Episode {
        id: row.get(0)?,
        podcast_id: row.get(1)?,
        guid: row.get(2)?,
        title: row.get(3)?,
        audio_url: row.get(4)?,
        published_at: row.get(5)?,
        duration: row.get(6)?,
        status: row.get::<_, String>(7)?.into(),
        transcript,
        last_error: row.get(9)?,
    })
}

fn map_clip(row: &Row<'_>) -> rusqlite::Result<Clip> {
    Ok(Clip {
        id: row.get(0)?,
        episode_id: row.get(1)?,
        start_time: row.get(2)?,
        end_time: row.get(3)?,
        duration: row.get(4)?,
        transcript: row.get(5)?,
        relevance_score: row.get(6)?,
        reasoning: row.get(7)?,
        summary: row.get(8)?,
        digest_id: row.get(9)?,
    })
}

fn map_digest(row: &Row<'_>) -> rusqlite::Result<Digest> {
    Ok(Digest {
        id: row.get(0)?,
        user_id: row.get(1)?,
        status: row.get::<_, String>(2)?.into(),
        podcast_id: row.get(3)?,
        episode_ids: parse_json_list(row.get::<_, String>(4)?),
        narrator_script: row.get(5)?,
        audio_url: row.get(6)?,
        duration: row.get(7)?,
        is_public: row.get::<_, i64>(8)? != 0,
        share_id: row.get(9)?,
        created_at: row.get(10)?,
        updated_at: row.get(11)?,
    })
}

fn map_job(row: &Row<'_>) -> rusqlite::Result<JobRecord> {
    let payload_json: String = row.get(4)?;
    Ok(JobRecord {
        id: row.get(0)?,
        queue: row.get(1)?,
        name: row.get(2)?,
        dedup_key: row.get(3)?,
        payload: serde_json::from_str(&payload_json).unwrap_or(serde_json::Value::Null),
        status: row.get::<_, String>(5)?.into(),
        attempts_made: row.get(6)?,
        max_attempts: row.get(7)?,
        backoff_delay_ms: row.get(8)?,
        progress: row.get(9)?,
        last_error: row.get(10)?,
        run_at: row.get(11)?,
        created_at: row.get(12)?,
        duration_ms: row.get(13)?,
    })
}

fn parse_json_list(json: String) -> Vec<String> {
    serde_json::from_str(&json).unwrap_or_default()
}

fn placeholders(n: usize) -> String {
    (1..=n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

fn shifted_placeholders(n: usize, start: usize) -> String {
    (start..start + n)
        .map(|i| format!("?{i}"))
        .collect::<Vec<_>>()
        .join(", ")
}

/// Quote status literals for an `IN (...)` clause; inputs are enum strings.
fn status_list<'a>(statuses: impl Iterator<Item = &'a str>) -> String {
    statuses
        .map(|s| format!("'{s}'"))
        .collect::<Vec<_>>()
        .join(", ")
}
