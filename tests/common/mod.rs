use airwave::db::{self, DbPool};
use tempfile::TempDir;

/// Database in a temp directory; the directory guard must outlive the pool.
pub fn temp_pool() -> (TempDir, DbPool) {
    let dir = TempDir::new().expect("tempdir");
    let pool = db::open_pool(&dir.path().join("airwave.db")).expect("open pool");
    db::init_schema(&pool).expect("init schema");
    (dir, pool)
}
