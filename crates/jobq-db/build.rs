//! Build script for embedded migrations.
//!
//! `sqlx::migrate!` embeds the SQL files at compile time, so the crate has to
//! be rebuilt whenever a migration changes.

fn main() {
    println!("cargo:rerun-if-changed=migrations/");
}
