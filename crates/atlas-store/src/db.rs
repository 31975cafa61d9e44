use rusqlite::{Connection, Result};

/// Initialise all tables. Safe to call on every startup (idempotent).
pub fn init_db(conn: &Connection) -> Result<()> {
    create_catalog_tables(conn)?;
    create_entry_tables(conn)?;
    create_attachment_tables(conn)?;
    create_outbox_tables(conn)?;
    create_conversation_tables(conn)?;
    create_ai_registry_tables(conn)?;
    create_assistant_config_tables(conn)?;
    Ok(())
}

fn create_catalog_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entry_types (
            id            TEXT PRIMARY KEY,
            code          TEXT NOT NULL UNIQUE,
            name          TEXT NOT NULL,
            color         TEXT,
            icon          TEXT,
            graph_enabled INTEGER NOT NULL DEFAULT 1,
            ai_enabled    INTEGER NOT NULL DEFAULT 1,
            enabled       INTEGER NOT NULL DEFAULT 1,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS tags (
            id          TEXT PRIMARY KEY,
            name        TEXT NOT NULL COLLATE NOCASE UNIQUE,
            color       TEXT,
            description TEXT,
            created_at  TEXT NOT NULL,
            updated_at  TEXT NOT NULL
        );
        CREATE TABLE IF NOT EXISTS relation_types (
            id         TEXT PRIMARY KEY,
            code       TEXT NOT NULL UNIQUE,
            name       TEXT NOT NULL,
            directed   INTEGER NOT NULL DEFAULT 1,
            enabled    INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );",
    )
}

fn create_entry_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entries (
            id         TEXT PRIMARY KEY,
            title      TEXT NOT NULL,
            summary    TEXT,
            content    TEXT,
            type_id    TEXT NOT NULL REFERENCES entry_types(id),
            time_mode  TEXT NOT NULL DEFAULT 'NONE',
            time_at    TEXT,
            time_from  TEXT,
            time_to    TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entries_type ON entries(type_id);
        CREATE INDEX IF NOT EXISTS idx_entries_updated ON entries(updated_at DESC);

        CREATE TABLE IF NOT EXISTS entry_tags (
            entry_id TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            tag_id   TEXT NOT NULL REFERENCES tags(id) ON DELETE CASCADE,
            PRIMARY KEY (entry_id, tag_id)
        );

        CREATE TABLE IF NOT EXISTS relations (
            id               TEXT PRIMARY KEY,
            source_entry_id  TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            target_entry_id  TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            relation_type_id TEXT NOT NULL REFERENCES relation_types(id),
            created_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_relations_source ON relations(source_entry_id);
        CREATE INDEX IF NOT EXISTS idx_relations_target ON relations(target_entry_id);",
    )
}

fn create_attachment_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS attachments (
            id                       TEXT PRIMARY KEY,
            entry_id                 TEXT NOT NULL REFERENCES entries(id) ON DELETE CASCADE,
            file_path                TEXT NOT NULL,
            original_filename        TEXT NOT NULL,
            content_type             TEXT NOT NULL,
            size                     INTEGER NOT NULL DEFAULT 0,
            parse_status             TEXT NOT NULL DEFAULT 'pending',
            parsed_text              TEXT,
            parsed_at                TEXT,
            parse_last_error         TEXT,
            index_to_knowledge_graph INTEGER NOT NULL DEFAULT 0,
            created_at               TEXT NOT NULL,
            updated_at               TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_attachments_entry ON attachments(entry_id);",
    )
}

/// All three outbox tables share the lease schema:
/// status/attempts/available_at plus (locked_at, locked_by) ownership.
/// The attachment tables intentionally carry no FK so delete events
/// survive the row they clean up after.
fn create_outbox_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS entry_index_outbox (
            id               TEXT PRIMARY KEY,
            entry_id         TEXT NOT NULL,
            op               TEXT NOT NULL,
            entry_updated_at TEXT,
            status           TEXT NOT NULL DEFAULT 'pending',
            attempts         INTEGER NOT NULL DEFAULT 0,
            available_at     TEXT NOT NULL,
            locked_at        TEXT,
            locked_by        TEXT,
            last_error       TEXT,
            created_at       TEXT NOT NULL,
            updated_at       TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_entry_outbox_pending
            ON entry_index_outbox(status, available_at);
        CREATE INDEX IF NOT EXISTS idx_entry_outbox_entry
            ON entry_index_outbox(entry_id);

        CREATE TABLE IF NOT EXISTS attachment_index_outbox (
            id            TEXT PRIMARY KEY,
            attachment_id TEXT NOT NULL,
            entry_id      TEXT NOT NULL,
            op            TEXT NOT NULL,
            status        TEXT NOT NULL DEFAULT 'pending',
            attempts      INTEGER NOT NULL DEFAULT 0,
            available_at  TEXT NOT NULL,
            locked_at     TEXT,
            locked_by     TEXT,
            last_error    TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_att_index_outbox_pending
            ON attachment_index_outbox(status, available_at);
        CREATE INDEX IF NOT EXISTS idx_att_index_outbox_attachment
            ON attachment_index_outbox(attachment_id);

        CREATE TABLE IF NOT EXISTS attachment_parse_outbox (
            id            TEXT PRIMARY KEY,
            attachment_id TEXT NOT NULL,
            entry_id      TEXT NOT NULL,
            op            TEXT NOT NULL DEFAULT 'upsert',
            status        TEXT NOT NULL DEFAULT 'pending',
            attempts      INTEGER NOT NULL DEFAULT 0,
            available_at  TEXT NOT NULL,
            locked_at     TEXT,
            locked_by     TEXT,
            last_error    TEXT,
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_att_parse_outbox_pending
            ON attachment_parse_outbox(status, available_at);",
    )
}

fn create_conversation_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS conversations (
            id              TEXT PRIMARY KEY,
            title           TEXT,
            is_archived     INTEGER NOT NULL DEFAULT 0,
            last_message_at TEXT,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS messages (
            id              TEXT PRIMARY KEY,
            conversation_id TEXT NOT NULL REFERENCES conversations(id) ON DELETE CASCADE,
            role            TEXT NOT NULL,
            content         TEXT NOT NULL DEFAULT '',
            tool_calls      TEXT,
            tool_results    TEXT,
            skill_calls     TEXT,
            analysis        TEXT,
            created_at      TEXT NOT NULL
        );
        CREATE INDEX IF NOT EXISTS idx_messages_conversation
            ON messages(conversation_id, created_at);",
    )
}

fn create_ai_registry_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS ai_credentials (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL UNIQUE,
            base_url          TEXT NOT NULL,
            api_key_encrypted TEXT NOT NULL,
            api_key_hint      TEXT NOT NULL,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS ai_models (
            id            TEXT PRIMARY KEY,
            credential_id TEXT NOT NULL REFERENCES ai_credentials(id) ON DELETE CASCADE,
            name          TEXT NOT NULL,
            model_type    TEXT NOT NULL CHECK (model_type IN ('llm','embedding')),
            created_at    TEXT NOT NULL,
            updated_at    TEXT NOT NULL,
            UNIQUE (credential_id, name, model_type)
        );

        CREATE TABLE IF NOT EXISTS ai_component_bindings (
            id                 TEXT PRIMARY KEY,
            component          TEXT NOT NULL UNIQUE CHECK (component IN ('assistant','lightrag')),
            llm_model_id       TEXT REFERENCES ai_models(id) ON DELETE SET NULL,
            embedding_model_id TEXT REFERENCES ai_models(id) ON DELETE SET NULL,
            created_at         TEXT NOT NULL,
            updated_at         TEXT NOT NULL
        );",
    )
}

fn create_assistant_config_tables(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS assistant_tools (
            id                TEXT PRIMARY KEY,
            name              TEXT NOT NULL UNIQUE,
            description       TEXT,
            kind              TEXT NOT NULL DEFAULT 'local',
            is_system         INTEGER NOT NULL DEFAULT 0,
            enabled           INTEGER NOT NULL DEFAULT 1,
            input_params      TEXT,
            endpoint_url      TEXT,
            http_method       TEXT,
            headers           TEXT,
            query_params      TEXT,
            body_type         TEXT,
            body_content      TEXT,
            auth_type         TEXT,
            auth_header_name  TEXT,
            auth_scheme       TEXT,
            api_key_encrypted TEXT,
            timeout_seconds   INTEGER,
            payload_wrapper   TEXT,
            created_at        TEXT NOT NULL,
            updated_at        TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS assistant_skills (
            id              TEXT PRIMARY KEY,
            name            TEXT NOT NULL UNIQUE,
            description     TEXT,
            intent_examples TEXT,
            tools           TEXT,
            mode            TEXT NOT NULL DEFAULT 'steps',
            system_prompt   TEXT,
            kb_enabled      INTEGER NOT NULL DEFAULT 0,
            is_system       INTEGER NOT NULL DEFAULT 0,
            enabled         INTEGER NOT NULL DEFAULT 1,
            created_at      TEXT NOT NULL,
            updated_at      TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS assistant_skill_steps (
            id                 TEXT PRIMARY KEY,
            skill_id           TEXT NOT NULL REFERENCES assistant_skills(id) ON DELETE CASCADE,
            step_order         INTEGER NOT NULL,
            step_type          TEXT NOT NULL,
            instruction        TEXT,
            tool_name          TEXT,
            args_from          TEXT,
            args_template      TEXT,
            output_mode        TEXT,
            output_fields      TEXT,
            include_in_summary INTEGER NOT NULL DEFAULT 1,
            UNIQUE (skill_id, step_order)
        );",
    )
}
