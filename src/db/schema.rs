//! Table layout. Timestamps are unix milliseconds; message ids are stored as
//! integers so range predicates compare numerically.

pub const SCHEMA: &str = "
    CREATE TABLE IF NOT EXISTS servers (
        id TEXT PRIMARY KEY,
        name TEXT NOT NULL,
        synced_at INTEGER NOT NULL
    );

    CREATE TABLE IF NOT EXISTS channels (
        id TEXT PRIMARY KEY,
        server_id TEXT NOT NULL,
        name TEXT NOT NULL,
        synced_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_channels_server ON channels (server_id);

    CREATE TABLE IF NOT EXISTS messages (
        id INTEGER PRIMARY KEY,
        server_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        author_id TEXT NOT NULL,
        author TEXT NOT NULL,
        is_bot BOOLEAN NOT NULL,
        content TEXT NOT NULL,
        reply_to_id INTEGER,
        timestamp INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_messages_channel ON messages (server_id, channel_id, id);
    CREATE INDEX IF NOT EXISTS idx_messages_timestamp ON messages (timestamp);

    CREATE TABLE IF NOT EXISTS summaries (
        id INTEGER PRIMARY KEY AUTOINCREMENT,
        server_id TEXT NOT NULL,
        channel_id TEXT NOT NULL,
        summary TEXT NOT NULL,
        num_messages INTEGER NOT NULL,
        from_timestamp INTEGER NOT NULL,
        to_timestamp INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );
    CREATE INDEX IF NOT EXISTS idx_summaries_channel ON summaries (server_id, channel_id, to_timestamp);
";
