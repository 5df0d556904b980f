//! Database schema and migrations for the SQLite store.

/// Database migrations.
///
/// Each migration is a SQL script executed in order. The schema_version
/// table tracks which migrations have been applied.
pub const MIGRATIONS: &[&str] = &[
    // v1: character cards and group bindings
    r#"
CREATE TABLE characters (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    user_id     TEXT NOT NULL,
    platform    TEXT NOT NULL,
    card_name   TEXT NOT NULL,
    card_type   TEXT NOT NULL,
    is_active   INTEGER NOT NULL DEFAULT 0,
    attributes  TEXT NOT NULL DEFAULT '{}',  -- JSON object
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE (user_id, platform, card_name)
);

CREATE INDEX idx_characters_owner ON characters(user_id, platform);

CREATE TABLE character_bindings (
    user_id     TEXT NOT NULL,
    platform    TEXT NOT NULL,
    group_id    TEXT NOT NULL,
    card_name   TEXT NOT NULL,
    PRIMARY KEY (user_id, platform, group_id)
);
"#,
    // v2: game sessions
    r#"
CREATE TABLE game_sessions (
    id          INTEGER PRIMARY KEY AUTOINCREMENT,
    name        TEXT NOT NULL,
    platform    TEXT NOT NULL,
    origin      TEXT NOT NULL,
    gm          TEXT NOT NULL DEFAULT '[]',
    players     TEXT NOT NULL DEFAULT '[]',
    observers   TEXT NOT NULL DEFAULT '[]',
    areas       TEXT NOT NULL DEFAULT '[]',
    config      TEXT NOT NULL DEFAULT '{}',
    roulette    TEXT NOT NULL DEFAULT '{}',
    is_logging  INTEGER NOT NULL DEFAULT 0,
    created_at  TEXT NOT NULL,
    updated_at  TEXT NOT NULL,
    UNIQUE (platform, name)
);
"#,
    // v3: script-visible key/value data
    r#"
CREATE TABLE group_data (
    group_id    TEXT NOT NULL,
    data_key    TEXT NOT NULL,
    data_value  TEXT NOT NULL,  -- JSON value
    PRIMARY KEY (group_id, data_key)
);

CREATE TABLE user_data (
    user_id     TEXT NOT NULL,
    data_key    TEXT NOT NULL,
    data_value  TEXT NOT NULL,  -- JSON value
    PRIMARY KEY (user_id, data_key)
);
"#,
];

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_migrations_not_empty() {
        assert_eq!(MIGRATIONS.len(), 3);
        assert!(MIGRATIONS.iter().all(|m| m.contains("CREATE TABLE")));
    }
}
