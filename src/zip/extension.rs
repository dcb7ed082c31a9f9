//! Hooks that let other components observe and amend an archive's lifecycle.

use super::entry::StoredEntry;
use super::file::ZipFile;
use crate::error::Result;

/// Work an extension asks to run once the current notification pass ends.
pub type DeferredAction = Box<dyn FnOnce(&mut ZipFile) -> Result<()> + Send>;

/// Wrap a closure as a [`DeferredAction`].
pub fn deferred<F>(action: F) -> DeferredAction
where
    F: FnOnce(&mut ZipFile) -> Result<()> + Send + 'static,
{
    Box::new(action)
}

/// Lifecycle points extensions are told about
#[derive(Debug)]
pub enum ZipEvent<'a> {
    /// The archive file was opened or created
    Open,
    /// An update is about to start; entries may still be added
    BeforeUpdate,
    /// An entry was placed, possibly replacing one with the same name
    Added {
        entry: &'a StoredEntry,
        replaced: Option<&'a StoredEntry>,
    },
    /// An entry was deleted
    Removed { entry: &'a StoredEntry },
    /// Entries are on disk, free space is zeroed and the central directory
    /// has been computed, but not written. The space reserved by the extra
    /// directory offset may be filled here with
    /// [`ZipFile::direct_write`]. Changing the archive recomputes the
    /// directory and fires this event again.
    EntriesWritten,
    /// The update finished
    Updated,
    /// The archive was closed
    Closed,
}

/// Observer of a [`ZipFile`].
///
/// Extensions are called in registration order and see the archive
/// read-only. To change it, return a [`DeferredAction`]; actions run in
/// order once the outermost notification pass completes. An error aborts
/// the pass and is returned by the operation that fired it.
pub trait ZipFileExtension: Send {
    fn notify(&mut self, zip: &ZipFile, event: &ZipEvent<'_>) -> Result<Option<DeferredAction>>;
}

/// Handle returned by [`ZipFile::register_extension`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExtensionId(pub(crate) u64);
