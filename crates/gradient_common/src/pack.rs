//! Toolbox archive writer.
//!
//! Produces the xz tar layout the extractor consumes: directories, regular
//! files with their modes, and symlinks stored verbatim (never followed).
//! Entries are written in sorted order so identical trees give identical archives.

use std::fs;
use std::io::{self, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use tar::{EntryType, Header};
use tracing::debug;

/// xz preset used for published toolboxes
pub const XZ_LEVEL: u32 = 9;

/// Write `src` as `<prefix>/...` into an xz-compressed tar stream
pub fn pack_dir<W: Write>(src: &Path, prefix: &str, writer: W) -> io::Result<W> {
    let encoder = xz2::write::XzEncoder::new(writer, XZ_LEVEL);
    let mut builder = tar::Builder::new(encoder);
    builder.follow_symlinks(false);

    append_tree(&mut builder, src, Path::new(prefix))?;

    let encoder = builder.into_inner()?;
    encoder.finish()
}

fn append_tree<W: Write>(
    builder: &mut tar::Builder<W>,
    dir: &Path,
    name: &Path,
) -> io::Result<()> {
    let meta = fs::symlink_metadata(dir)?;
    let mut header = Header::new_gnu();
    header.set_entry_type(EntryType::Directory);
    header.set_mode(meta.permissions().mode() & 0o7777);
    header.set_size(0);
    builder.append_data(&mut header, name, io::empty())?;

    let mut children: Vec<_> = fs::read_dir(dir)?.collect::<io::Result<_>>()?;
    children.sort_by_key(|entry| entry.file_name());

    for child in children {
        let path = child.path();
        let child_name = name.join(child.file_name());
        let meta = fs::symlink_metadata(&path)?;
        let file_type = meta.file_type();

        if file_type.is_dir() {
            append_tree(builder, &path, &child_name)?;
        } else if file_type.is_symlink() {
            let target = fs::read_link(&path)?;
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Symlink);
            header.set_mode(0o777);
            header.set_size(0);
            builder.append_link(&mut header, &child_name, &target)?;
        } else if file_type.is_file() {
            let mut header = Header::new_gnu();
            header.set_entry_type(EntryType::Regular);
            header.set_mode(meta.permissions().mode() & 0o7777);
            header.set_size(meta.len());
            let file = fs::File::open(&path)?;
            builder.append_data(&mut header, &child_name, file)?;
        } else {
            debug!(path = %path.display(), "Skipping special file");
        }
    }
    Ok(())
}
