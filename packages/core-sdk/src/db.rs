use rusqlite::{params, Connection, ErrorCode, OptionalExtension, Row};
use std::{path::Path, thread, time::Duration};
use tracing::warn;

use crate::config::AppConfig;
use crate::error::{Error, Result};
use crate::models::{HistoryRecord, HistoryStats, ListFilter, RecordStatus, Session, User};

const CONFIG_KEY: &str = "redink-user-config";
const AUTH_TOKEN_KEY: &str = "auth_token";
const AUTH_USER_KEY: &str = "auth_user";

/**
 * \brief 打开指定路径的数据库并执行迁移。
 */
pub fn open_db(path: impl AsRef<Path>) -> Result<Connection> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(Duration::from_secs(5))?;
    migrate(&conn)?;
    Ok(conn)
}

/**
 * \brief 打开默认数据库文件（本地目录下的 redink.db）。
 */
pub fn open_default_db() -> Result<Connection> {
    open_db("redink.db")
}

/**
 * \brief 运行数据库迁移，创建必要表结构。
 */
pub fn migrate(conn: &Connection) -> Result<()> {
    retry_on_locked(|| {
        conn.execute_batch(
            r#"
        PRAGMA journal_mode=WAL;
        CREATE TABLE IF NOT EXISTS app_config (
            key TEXT PRIMARY KEY,
            value TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS history (
            seq INTEGER PRIMARY KEY AUTOINCREMENT,
            id TEXT NOT NULL UNIQUE,
            title TEXT NOT NULL,
            status TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            data TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_history_status ON history(status);
        "#,
        )
    })
}

pub fn get_config_value(conn: &Connection, key: &str) -> Result<Option<String>> {
    let val = conn
        .query_row(
            "SELECT value FROM app_config WHERE key=?1",
            params![key],
            |row| row.get::<_, String>(0),
        )
        .optional()?;
    Ok(val)
}

pub fn set_config_value(conn: &Connection, key: &str, value: &str) -> Result<()> {
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO app_config (key, value) VALUES (?1, ?2)
         ON CONFLICT(key) DO UPDATE SET value=excluded.value",
            params![key, value],
        )
    })?;
    Ok(())
}

pub fn delete_config_value(conn: &Connection, key: &str) -> Result<()> {
    retry_on_locked(|| conn.execute("DELETE FROM app_config WHERE key=?1", params![key]))?;
    Ok(())
}

/**
 * \brief 读取应用配置；不存在或无法解析时返回默认配置。
 */
pub fn load_app_config(conn: &Connection) -> Result<AppConfig> {
    match get_config_value(conn, CONFIG_KEY)? {
        Some(raw) => match AppConfig::from_stored_json(&raw) {
            Ok(config) => Ok(config),
            Err(err) => {
                warn!(error = %err, "stored config unreadable, using defaults");
                Ok(AppConfig::default())
            }
        },
        None => Ok(AppConfig::default()),
    }
}

pub fn save_app_config(conn: &Connection, config: &AppConfig) -> Result<()> {
    set_config_value(conn, CONFIG_KEY, &config.to_stored_json()?)
}

pub fn clear_app_config(conn: &Connection) -> Result<()> {
    delete_config_value(conn, CONFIG_KEY)
}

/**
 * \brief 读取缓存的登录会话。用户信息损坏时视为未登录并清除。
 */
pub fn load_session(conn: &Connection) -> Result<Option<Session>> {
    let token = get_config_value(conn, AUTH_TOKEN_KEY)?;
    let user = get_config_value(conn, AUTH_USER_KEY)?;
    let (Some(token), Some(user)) = (token, user) else {
        return Ok(None);
    };
    match serde_json::from_str::<User>(&user) {
        Ok(user) => Ok(Some(Session { token, user })),
        Err(err) => {
            warn!(error = %err, "cached auth user is corrupt, clearing session");
            clear_session(conn)?;
            Ok(None)
        }
    }
}

pub fn save_session(conn: &Connection, session: &Session) -> Result<()> {
    let user = serde_json::to_string(&session.user).map_err(|e| Error::Storage(e.to_string()))?;
    set_config_value(conn, AUTH_TOKEN_KEY, &session.token)?;
    set_config_value(conn, AUTH_USER_KEY, &user)
}

pub fn clear_session(conn: &Connection) -> Result<()> {
    delete_config_value(conn, AUTH_TOKEN_KEY)?;
    delete_config_value(conn, AUTH_USER_KEY)
}

fn encode_record(record: &HistoryRecord) -> Result<String> {
    serde_json::to_string(record).map_err(|e| Error::Storage(e.to_string()))
}

fn decode_record(row: &Row<'_>) -> rusqlite::Result<HistoryRecord> {
    let raw: String = row.get(0)?;
    let mut record: HistoryRecord = serde_json::from_str(&raw).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(0, rusqlite::types::Type::Text, Box::new(e))
    })?;
    record.page_count = record.outline.pages.len() as u32;
    Ok(record)
}

/**
 * \brief 新增历史记录。
 */
pub fn insert_history(conn: &Connection, record: &HistoryRecord) -> Result<()> {
    let data = encode_record(record)?;
    retry_on_locked(|| {
        conn.execute(
            "INSERT INTO history (id, title, status, created_at, updated_at, data)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                record.id,
                record.title,
                record.status.as_str(),
                record.created_at,
                record.updated_at,
                data
            ],
        )
    })?;
    Ok(())
}

/**
 * \brief 覆盖已有记录，返回是否命中。
 */
pub fn update_history(conn: &Connection, record: &HistoryRecord) -> Result<bool> {
    let data = encode_record(record)?;
    let affected = retry_on_locked(|| {
        conn.execute(
            "UPDATE history SET title=?2, status=?3, updated_at=?4, data=?5 WHERE id=?1",
            params![
                record.id,
                record.title,
                record.status.as_str(),
                record.updated_at,
                data
            ],
        )
    })?;
    Ok(affected > 0)
}

pub fn get_history(conn: &Connection, id: &str) -> Result<Option<HistoryRecord>> {
    let record = conn
        .query_row(
            "SELECT data FROM history WHERE id=?1",
            params![id],
            decode_record,
        )
        .optional()?;
    Ok(record)
}

pub fn delete_history(conn: &Connection, id: &str) -> Result<bool> {
    let affected =
        retry_on_locked(|| conn.execute("DELETE FROM history WHERE id=?1", params![id]))?;
    Ok(affected > 0)
}

/**
 * \brief 分页查询历史记录，最新创建的在前。返回当前页与过滤后的总数。
 */
pub fn list_history(
    conn: &Connection,
    filter: &ListFilter,
    offset: u64,
    limit: u64,
) -> Result<(Vec<HistoryRecord>, u64)> {
    let status = filter.status.map(|s| s.as_str());
    let keyword = filter
        .keyword
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty());
    const WHERE: &str = "(?1 IS NULL OR status = ?1)
         AND (?2 IS NULL OR instr(lower(title), lower(?2)) > 0)";

    let total: u64 = conn.query_row(
        &format!("SELECT COUNT(*) FROM history WHERE {}", WHERE),
        params![status, keyword],
        |row| row.get::<_, i64>(0),
    )? as u64;

    let mut stmt = conn.prepare(&format!(
        "SELECT data FROM history WHERE {} ORDER BY seq DESC LIMIT ?3 OFFSET ?4",
        WHERE
    ))?;
    let rows = stmt.query_map(
        params![status, keyword, limit as i64, offset as i64],
        decode_record,
    )?;
    let mut out = Vec::new();
    for r in rows {
        out.push(r?);
    }
    Ok((out, total))
}

pub fn history_stats(conn: &Connection) -> Result<HistoryStats> {
    let mut stmt = conn.prepare("SELECT status, COUNT(*) FROM history GROUP BY status")?;
    let rows = stmt.query_map([], |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;
    let mut stats = HistoryStats::default();
    for r in rows {
        let (status, count) = r?;
        stats.total += count as u64;
        match RecordStatus::parse(&status) {
            Some(s) => {
                stats.by_status.insert(s, count as u64);
            }
            None => warn!(status = %status, "unknown history status in database"),
        }
    }
    Ok(stats)
}

/**
 * \brief 历史记录占用的字节数。
 */
pub fn history_bytes(conn: &Connection) -> Result<u64> {
    let bytes: i64 = conn.query_row(
        "SELECT COALESCE(SUM(LENGTH(CAST(data AS BLOB))), 0) FROM history",
        [],
        |row| row.get(0),
    )?;
    Ok(bytes as u64)
}

/**
 * \brief 只保留最新的 keep 条记录（preserve 指定的记录始终保留并计入），返回删除条数。
 */
pub fn trim_history(conn: &Connection, keep: usize, preserve: &str) -> Result<usize> {
    let others = keep.saturating_sub(1) as i64;
    let removed = retry_on_locked(|| {
        conn.execute(
            "DELETE FROM history WHERE id != ?1 AND seq NOT IN (
                SELECT seq FROM history WHERE id != ?1 ORDER BY seq DESC LIMIT ?2
            )",
            params![preserve, others],
        )
    })?;
    Ok(removed)
}

/**
 * \brief 针对 SQLite 锁冲突的重试助手。
 * \details 捕获 `database is locked`/`database table is locked` 等错误并进行指数退避，最大尝试 6 次。
 */
fn retry_on_locked<T, F>(mut action: F) -> Result<T>
where
    F: FnMut() -> rusqlite::Result<T>,
{
    const MAX_RETRIES: usize = 5;
    let mut attempt = 0;
    loop {
        match action() {
            Ok(value) => return Ok(value),
            Err(rusqlite::Error::SqliteFailure(err, _))
                if matches!(
                    err.code,
                    ErrorCode::DatabaseBusy | ErrorCode::DatabaseLocked
                ) && attempt < MAX_RETRIES =>
            {
                attempt += 1;
                thread::sleep(Duration::from_millis(200 * attempt as u64));
            }
            Err(e) => return Err(e.into()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::{now_rfc3339, HistoryImages, Outline, Page, PageType, User};

    fn mem_conn() -> Connection {
        let conn = Connection::open_in_memory().expect("open in-memory db");
        migrate(&conn).expect("migrate");
        conn
    }

    fn record(id: &str, title: &str, status: RecordStatus) -> HistoryRecord {
        HistoryRecord {
            id: id.to_string(),
            title: title.to_string(),
            created_at: now_rfc3339(),
            updated_at: now_rfc3339(),
            outline: Outline {
                raw: "a<page>b".into(),
                pages: vec![
                    Page {
                        index: 0,
                        page_type: PageType::Cover,
                        content: "a".into(),
                    },
                    Page {
                        index: 1,
                        page_type: PageType::Summary,
                        content: "b".into(),
                    },
                ],
            },
            images: HistoryImages::default(),
            status,
            thumbnail: None,
            page_count: 0,
        }
    }

    #[test]
    fn test_config_round_trip_and_defaults() {
        let conn = mem_conn();
        let loaded = load_app_config(&conn).expect("load default");
        assert_eq!(loaded, AppConfig::default());

        let mut cfg = AppConfig::default();
        cfg.preferences.theme = "dark".into();
        save_app_config(&conn, &cfg).expect("save");
        assert_eq!(load_app_config(&conn).expect("reload"), cfg);

        set_config_value(&conn, CONFIG_KEY, "{broken").expect("corrupt");
        assert_eq!(load_app_config(&conn).expect("fallback"), AppConfig::default());

        clear_app_config(&conn).expect("clear");
        assert!(get_config_value(&conn, CONFIG_KEY).expect("get").is_none());
    }

    #[test]
    fn test_session_persistence() {
        let conn = mem_conn();
        assert!(load_session(&conn).expect("empty").is_none());

        let session = Session {
            token: "tok".into(),
            user: User {
                id: "u1".into(),
                email: "a@example.com".into(),
                name: "A".into(),
                avatar_url: None,
                is_active: true,
            },
        };
        save_session(&conn, &session).expect("save");
        assert_eq!(load_session(&conn).expect("load"), Some(session));

        set_config_value(&conn, AUTH_USER_KEY, "not json").expect("corrupt");
        assert!(load_session(&conn).expect("corrupt load").is_none());
        assert!(get_config_value(&conn, AUTH_TOKEN_KEY).expect("get").is_none());
    }

    #[test]
    fn test_history_crud() {
        let conn = mem_conn();
        let mut r = record("r1", "秋季穿搭", RecordStatus::Draft);
        insert_history(&conn, &r).expect("insert");

        let loaded = get_history(&conn, "r1").expect("get").expect("exists");
        assert_eq!(loaded.page_count, 2);
        assert_eq!(loaded.title, "秋季穿搭");

        r.status = RecordStatus::Completed;
        assert!(update_history(&conn, &r).expect("update"));
        assert_eq!(
            get_history(&conn, "r1").expect("get").expect("exists").status,
            RecordStatus::Completed
        );
        assert!(!update_history(&conn, &record("missing", "x", RecordStatus::Draft))
            .expect("update missing"));

        assert!(delete_history(&conn, "r1").expect("delete"));
        assert!(!delete_history(&conn, "r1").expect("delete again"));
        assert!(get_history(&conn, "r1").expect("get").is_none());
    }

    #[test]
    fn test_list_filters_and_pagination() {
        let conn = mem_conn();
        for i in 0..5 {
            let status = if i % 2 == 0 {
                RecordStatus::Completed
            } else {
                RecordStatus::Draft
            };
            insert_history(&conn, &record(&format!("r{}", i), &format!("Topic {}", i), status))
                .expect("insert");
        }

        let (page, total) = list_history(&conn, &ListFilter::default(), 0, 2).expect("list");
        assert_eq!(total, 5);
        assert_eq!(
            page.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r4", "r3"]
        );

        let completed = ListFilter {
            status: Some(RecordStatus::Completed),
            keyword: None,
        };
        let (page, total) = list_history(&conn, &completed, 2, 2).expect("list completed");
        assert_eq!(total, 3);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, "r0");

        let search = ListFilter {
            status: None,
            keyword: Some("topic 3".into()),
        };
        let (page, total) = list_history(&conn, &search, 0, 20).expect("search");
        assert_eq!(total, 1);
        assert_eq!(page[0].id, "r3");

        let stats = history_stats(&conn).expect("stats");
        assert_eq!(stats.total, 5);
        assert_eq!(stats.by_status[&RecordStatus::Completed], 3);
        assert_eq!(stats.by_status[&RecordStatus::Draft], 2);
    }

    #[test]
    fn test_trim_keeps_newest_and_preserved() {
        let conn = mem_conn();
        for i in 0..6 {
            insert_history(&conn, &record(&format!("r{}", i), "t", RecordStatus::Draft))
                .expect("insert");
        }
        assert!(history_bytes(&conn).expect("bytes") > 0);

        let removed = trim_history(&conn, 3, "r0").expect("trim");
        assert_eq!(removed, 3);
        let (rows, total) = list_history(&conn, &ListFilter::default(), 0, 10).expect("list");
        assert_eq!(total, 3);
        assert_eq!(
            rows.iter().map(|r| r.id.as_str()).collect::<Vec<_>>(),
            vec!["r5", "r4", "r0"]
        );
    }

    #[test]
    fn test_on_disk_db_survives_reopen() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("redink.db");
        {
            let conn = open_db(&path).expect("open");
            let mut config = AppConfig::default();
            config.preferences.theme = "dark".into();
            save_app_config(&conn, &config).expect("save config");
            insert_history(&conn, &record("r1", "持久化", RecordStatus::Completed))
                .expect("insert");
        }

        let conn = open_db(&path).expect("reopen");
        assert_eq!(load_app_config(&conn).expect("load").preferences.theme, "dark");
        let loaded = get_history(&conn, "r1").expect("get").expect("present");
        assert_eq!(loaded.title, "持久化");
        assert_eq!(loaded.status, RecordStatus::Completed);
    }
}
