//! Versioned schema, embedded at build time from `migrations/`.

mod embedded {
    use refinery::embed_migrations;
    embed_migrations!("migrations");
}

/// Apply pending migrations. Applied versions are tracked in
/// `refinery_schema_history`.
pub(crate) fn run(conn: &mut rusqlite::Connection) -> Result<refinery::Report, refinery::Error> {
    embedded::migrations::runner().run(conn)
}
