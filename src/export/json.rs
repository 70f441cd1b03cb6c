use std::io::Write;

use crate::state::Snapshot;

/// Write a snapshot as pretty-printed JSON, newline terminated
pub fn export_json<W: Write>(snapshot: &Snapshot, mut writer: W) -> std::io::Result<()> {
    serde_json::to_writer_pretty(&mut writer, snapshot)?;
    writeln!(writer)?;
    Ok(())
}
