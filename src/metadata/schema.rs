//! SQL schema for the Metadata Store (§4.3), applied at startup with
//! `CREATE TABLE IF NOT EXISTS` — idempotent across restarts, no external
//! migration tooling required.

pub const STATEMENTS: &[&str] = &[
    "PRAGMA foreign_keys = ON",
    r#"CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        transport_kind TEXT NOT NULL,
        command TEXT,
        args TEXT NOT NULL DEFAULT '[]',
        env TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS capabilities (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        name TEXT NOT NULL UNIQUE,
        description TEXT,
        created_at TEXT NOT NULL
    )"#,
    r#"CREATE TABLE IF NOT EXISTS server_capabilities (
        server_id TEXT NOT NULL,
        capability_id INTEGER NOT NULL,
        PRIMARY KEY (server_id, capability_id),
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE,
        FOREIGN KEY (capability_id) REFERENCES capabilities(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS tools (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL,
        name TEXT NOT NULL,
        description TEXT NOT NULL DEFAULT '',
        schema TEXT NOT NULL DEFAULT '{}',
        created_at TEXT NOT NULL,
        updated_at TEXT NOT NULL,
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE,
        UNIQUE (server_id, name)
    )"#,
    r#"CREATE TABLE IF NOT EXISTS server_health (
        server_id TEXT PRIMARY KEY,
        status TEXT NOT NULL,
        last_check TEXT,
        last_successful_connection TEXT,
        error_count INTEGER NOT NULL DEFAULT 0,
        average_response_time REAL NOT NULL DEFAULT 0.0,
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS server_usage (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL,
        tool_name TEXT NOT NULL,
        execution_time REAL NOT NULL,
        success INTEGER NOT NULL,
        timestamp TEXT NOT NULL,
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
    )"#,
    r#"CREATE TABLE IF NOT EXISTS server_tags (
        server_id TEXT NOT NULL,
        tag TEXT NOT NULL,
        PRIMARY KEY (server_id, tag),
        FOREIGN KEY (server_id) REFERENCES servers(id) ON DELETE CASCADE
    )"#,
    "CREATE INDEX IF NOT EXISTS idx_server_capabilities_server ON server_capabilities(server_id)",
    "CREATE INDEX IF NOT EXISTS idx_server_capabilities_capability ON server_capabilities(capability_id)",
    "CREATE INDEX IF NOT EXISTS idx_tools_server ON tools(server_id)",
    "CREATE INDEX IF NOT EXISTS idx_server_usage_server ON server_usage(server_id)",
    "CREATE INDEX IF NOT EXISTS idx_server_usage_timestamp ON server_usage(timestamp)",
    "CREATE INDEX IF NOT EXISTS idx_server_tags_tag ON server_tags(tag)",
];
