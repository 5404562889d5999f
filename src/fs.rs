// Copyright 2026 Alexander Orlov <alexander.orlov@loxal.net>

use std::collections::HashMap;
use std::ffi::{CString, OsStr};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Seek, SeekFrom};
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::os::unix::fs::{FileExt, FileTypeExt, MetadataExt, OpenOptionsExt};
use std::os::unix::io::{AsRawFd, FromRawFd, IntoRawFd};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, SystemTime};

use fuse_mt::{
    CallbackResult, CreatedEntry, DirectoryEntry, FileAttr, FileType, FilesystemMT, RequestInfo,
    ResultCreate, ResultData, ResultEmpty, ResultEntry, ResultOpen, ResultReaddir, ResultSlice,
    ResultStatfs, ResultWrite, ResultXattr, Statfs, Xattr,
};
use log::{debug, warn};

use crate::crypto::{self, GpgTool};

const TTL: Duration = Duration::from_secs(1);

fn errno(err: io::Error) -> libc::c_int {
    err.raw_os_error().unwrap_or(libc::EIO)
}

// --- Open-file state ---

/// One logical open of a path. Every concurrent open of the same path
/// aliases a single instance of this; `refcount` tracks the aliases.
///
/// The plaintext lives in `buffer`. `buffer_loaded` means the buffer holds
/// the complete plaintext; an `O_APPEND` handle instead accumulates only the
/// appended tail and leaves `buffer_loaded` false, so its close emits a
/// fresh ciphertext block after the existing ones.
struct OpenFile {
    file: File,
    flags: i32,
    refcount: u32,
    path: PathBuf,
    buffer: Vec<u8>,
    buffer_loaded: bool,
    dirty: bool,
    recipients: Arc<Vec<String>>,
    tool: Arc<GpgTool>,
}

impl OpenFile {
    /// Decrypt the backing file into `buffer`. No-op once loaded.
    fn load_buffer(&mut self) -> io::Result<()> {
        if self.buffer_loaded {
            return Ok(());
        }

        self.dirty = false;
        self.buffer.clear();

        let size = self.file.metadata()?.len() as usize;
        if size == 0 {
            self.buffer_loaded = true;
            return Ok(());
        }

        let mut ciphertext = vec![0u8; size];
        self.file.read_exact_at(&mut ciphertext, 0)?;

        for block in crypto::split_blocks(&ciphertext) {
            if block.start == 0 && block.end == ciphertext.len() {
                // Single message: hand the tool the descriptor itself. The
                // dup shares our file offset, so rewind afterwards.
                let result = self.tool.decrypt_fd(self.file.try_clone()?, &mut self.buffer);
                self.file.seek(SeekFrom::Start(0))?;
                result?;
            } else {
                self.tool.decrypt(&ciphertext[block], &mut self.buffer)?;
            }
        }

        self.buffer_loaded = true;
        Ok(())
    }

    /// Encrypt the buffer over the backing file.
    fn encrypt_to_backing(&mut self) -> io::Result<()> {
        if self.buffer_loaded || self.flags & libc::O_APPEND == 0 {
            // The buffer is the whole plaintext: the child's ciphertext must
            // become the entire file contents. Only an append session that
            // never loaded holds a bare tail, which goes after the existing
            // blocks instead.
            self.file.set_len(0)?;
            self.file.seek(SeekFrom::Start(0))?;
        }
        self.tool
            .encrypt(&self.buffer, &self.recipients, self.file.try_clone()?)?;
        self.dirty = false;
        Ok(())
    }

    /// Flush if dirty, then close the backing descriptor. A flush failure
    /// wins over a close failure; a close failure is still reported when
    /// the flush succeeded.
    fn close(mut self) -> io::Result<()> {
        let flushed = if self.dirty {
            self.encrypt_to_backing()
        } else {
            Ok(())
        };
        let close_rc = unsafe { libc::close(self.file.into_raw_fd()) };
        let close_err = if close_rc != 0 {
            Some(io::Error::last_os_error())
        } else {
            None
        };
        flushed?;
        match close_err {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }
}

// --- Handle registry ---

#[derive(Default)]
struct Registry {
    by_path: HashMap<PathBuf, u64>,
    by_handle: HashMap<u64, OpenFile>,
    next_handle: u64,
}

impl Registry {
    fn allocate(&mut self) -> u64 {
        self.next_handle += 1;
        self.next_handle
    }
}

// --- Filesystem ---

pub struct AsymFs {
    root: File,
    root_path: PathBuf,
    read_enabled: bool,
    recipients: Arc<Vec<String>>,
    tool: Arc<GpgTool>,
    state: Mutex<Registry>,
}

impl AsymFs {
    pub fn new(backing: &Path, read_enabled: bool, tool: GpgTool) -> io::Result<Self> {
        let root = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_DIRECTORY)
            .open(backing)?;
        Ok(Self {
            root,
            root_path: backing.to_path_buf(),
            read_enabled,
            recipients: Arc::new(Vec::new()),
            tool: Arc::new(tool),
            state: Mutex::new(Registry::default()),
        })
    }

    /// Replace the recipient list. Every open file holds a reference to the
    /// list it was opened under, so swapping it mid-flight is a programming
    /// error, not an I/O error.
    pub fn set_recipients(&mut self, recipients: Vec<String>) {
        let registry = self.registry();
        if !registry.by_handle.is_empty() {
            panic!("changing recipients with open files");
        }
        drop(registry);
        self.recipients = Arc::new(recipients);
    }

    pub fn ready(&self) -> bool {
        self.root.metadata().is_ok() && !self.recipients.is_empty()
    }

    fn registry(&self) -> MutexGuard<'_, Registry> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Mountpoint path rebased onto the backing directory.
    fn rebase(&self, path: &Path) -> PathBuf {
        self.root_path.join(path.strip_prefix("/").unwrap_or(path))
    }

    fn backing_cstring(&self, path: &Path) -> Result<CString, libc::c_int> {
        CString::new(self.rebase(path).into_os_string().into_vec()).map_err(|_| libc::EINVAL)
    }

    /// `/x/y` becomes `./x/y`, resolved relative to the root descriptor.
    fn openat(&self, path: &Path, flags: i32, mode: u32) -> io::Result<File> {
        let mut rel = b".".to_vec();
        rel.extend_from_slice(path.as_os_str().as_bytes());
        let rel = CString::new(rel).map_err(|_| io::Error::from_raw_os_error(libc::EINVAL))?;
        let fd = unsafe {
            libc::openat(
                self.root.as_raw_fd(),
                rel.as_ptr(),
                flags | libc::O_CLOEXEC,
                mode as libc::c_uint,
            )
        };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(unsafe { File::from_raw_fd(fd) })
    }

    /// With reads enabled the engine needs a read-capable descriptor even
    /// for write-only callers: truncating to a nonzero size has to decrypt
    /// first. `O_WRONLY` is therefore promoted to `O_RDWR`.
    fn make_rdwr(&self, flags: i32) -> i32 {
        if self.read_enabled && flags & libc::O_ACCMODE == libc::O_WRONLY {
            (flags & !libc::O_ACCMODE) | libc::O_RDWR
        } else {
            flags
        }
    }

    fn new_open_file(&self, file: File, flags: i32, path: &Path, buffer_loaded: bool) -> OpenFile {
        OpenFile {
            file,
            flags,
            refcount: 1,
            path: path.to_path_buf(),
            buffer: Vec::new(),
            buffer_loaded,
            dirty: false,
            recipients: Arc::clone(&self.recipients),
            tool: Arc::clone(&self.tool),
        }
    }

    // --- Operations ---

    fn create_file(&self, path: &Path, mode: u32, flags: i32) -> Result<u64, libc::c_int> {
        let flags = flags | libc::O_CREAT;
        let mut registry = self.registry();
        let file = match self.openat(path, self.make_rdwr(flags), mode) {
            Ok(f) => f,
            Err(e)
                if self.read_enabled
                    && flags & libc::O_ACCMODE == libc::O_WRONLY
                    && e.raw_os_error() == Some(libc::EACCES) =>
            {
                // Promotion denied by the backing filesystem; fall back to
                // the caller's own flags.
                self.openat(path, flags, mode).map_err(errno)?
            }
            Err(e) => return Err(errno(e)),
        };

        let fh = registry.allocate();
        registry.by_path.insert(path.to_path_buf(), fh);
        registry
            .by_handle
            .insert(fh, self.new_open_file(file, flags, path, true));
        Ok(fh)
    }

    fn open_path(&self, path: &Path, flags: i32) -> Result<u64, libc::c_int> {
        let mut registry = self.registry();

        if let Some(&fh) = registry.by_path.get(path) {
            if let Some(open) = registry.by_handle.get_mut(&fh) {
                open.refcount += 1;
                return Ok(fh);
            }
        }

        let mut flags = flags;
        let access_mode = flags & libc::O_ACCMODE;
        let for_reading = access_mode == libc::O_RDONLY || access_mode == libc::O_RDWR;
        if !self.read_enabled && for_reading && flags & libc::O_CREAT != 0 {
            // The file must not pre-exist, or its plaintext would become
            // readable in write-only mode.
            flags |= libc::O_EXCL;
        }

        let file = match self.openat(path, self.make_rdwr(flags), 0) {
            Ok(f) => f,
            Err(e)
                if self.read_enabled
                    && !for_reading
                    && e.raw_os_error() == Some(libc::EACCES) =>
            {
                self.openat(path, flags, 0).map_err(errno)?
            }
            Err(e) => return Err(errno(e)),
        };

        // A just-created file is empty: treat the empty buffer as loaded.
        // This is what permits truncate-to-nonzero even in write-only mode.
        // Anything else defers decryption until the first read.
        let buffer_loaded = file.metadata().map(|m| m.len() == 0).unwrap_or(false);

        let fh = registry.allocate();
        registry.by_path.insert(path.to_path_buf(), fh);
        registry
            .by_handle
            .insert(fh, self.new_open_file(file, flags, path, buffer_loaded));
        Ok(fh)
    }

    fn read_handle(&self, fh: u64, offset: u64, size: u32) -> Result<Vec<u8>, libc::c_int> {
        let mut registry = self.registry();
        let open = registry.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;

        if self.read_enabled {
            open.load_buffer().map_err(errno)?;
        } else if !open.buffer_loaded || open.flags & libc::O_APPEND != 0 {
            // Only a buffer this session accumulated itself may be read
            // back, and an append buffer does not represent the file head.
            return Err(libc::EACCES);
        }

        let offset = offset as usize;
        if offset >= open.buffer.len() {
            return Ok(Vec::new());
        }
        let end = open.buffer.len().min(offset + size as usize);
        Ok(open.buffer[offset..end].to_vec())
    }

    fn write_handle(&self, fh: u64, offset: u64, data: &[u8]) -> Result<u32, libc::c_int> {
        let mut registry = self.registry();
        let open = registry.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;

        if data.is_empty() {
            return Ok(0);
        }
        if self.read_enabled && !open.buffer_loaded && open.flags & libc::O_APPEND == 0 {
            // Bring in the existing plaintext first, or the unwritten
            // regions would vanish at close.
            open.load_buffer().map_err(errno)?;
        }

        let offset = offset as usize;
        let end = offset + data.len();
        if end > open.buffer.len() {
            open.buffer.resize(end, 0);
        }
        open.buffer[offset..end].copy_from_slice(data);
        open.dirty = true;
        Ok(data.len() as u32)
    }

    fn truncate_open(&self, open: &mut OpenFile, size: u64) -> Result<(), libc::c_int> {
        if size == 0 {
            open.file.set_len(0).map_err(errno)?;
            open.buffer.clear();
            open.dirty = true;
            Ok(())
        } else if self.read_enabled {
            open.load_buffer().map_err(errno)?;
            open.buffer.resize(size as usize, 0);
            open.dirty = true;
            Ok(())
        } else {
            Err(libc::EACCES)
        }
    }

    fn truncate_handle(&self, fh: u64, size: u64) -> Result<(), libc::c_int> {
        let mut registry = self.registry();
        let open = registry.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;
        self.truncate_open(open, size)
    }

    fn truncate_path(&self, path: &Path, size: u64) -> Result<(), libc::c_int> {
        let mut registry = self.registry();
        if let Some(&fh) = registry.by_path.get(path) {
            let open = registry.by_handle.get_mut(&fh).ok_or(libc::EBADF)?;
            return self.truncate_open(open, size);
        }

        if size == 0 {
            let file = self.openat(path, libc::O_WRONLY, 0).map_err(errno)?;
            return file.set_len(0).map_err(errno);
        }
        if !self.read_enabled {
            return Err(libc::EACCES);
        }

        // Decrypt, truncate, re-encrypt through a short-lived handle.
        let file = self.openat(path, libc::O_RDWR, 0).map_err(errno)?;
        let mut open = self.new_open_file(file, libc::O_RDWR, path, false);
        open.refcount = 0;
        open.load_buffer().map_err(errno)?;
        open.buffer.resize(size as usize, 0);
        open.dirty = true;
        open.close().map_err(errno)
    }

    fn release_handle(&self, fh: u64) -> Result<(), libc::c_int> {
        let mut registry = self.registry();
        let Some(open) = registry.by_handle.get_mut(&fh) else {
            // Already released, or never issued.
            return Ok(());
        };
        open.refcount -= 1;
        if open.refcount > 0 {
            return Ok(());
        }

        let open = registry.by_handle.remove(&fh).expect("handle vanished");
        if registry.by_path.get(&open.path) == Some(&fh) {
            registry.by_path.remove(&open.path);
        }
        let path = open.path.clone();
        if let Err(e) = open.close() {
            // The host discards release errors; flush regardless.
            warn!("closing {:?} failed: {}", path, e);
        }
        Ok(())
    }

    fn rename_path(&self, old: &Path, new: &Path) -> Result<(), libc::c_int> {
        let mut registry = self.registry();
        fs::rename(self.rebase(old), self.rebase(new)).map_err(errno)?;
        // Registry follows if and only if the backing rename landed.
        if let Some(fh) = registry.by_path.remove(old) {
            registry.by_path.insert(new.to_path_buf(), fh);
            if let Some(open) = registry.by_handle.get_mut(&fh) {
                open.path = new.to_path_buf();
            }
        }
        Ok(())
    }

    fn stat_open(open: &OpenFile) -> Result<FileAttr, libc::c_int> {
        let meta = open.file.metadata().map_err(errno)?;
        let mut attr = attr_from_metadata(&meta);
        if open.buffer_loaded {
            attr.size = open.buffer.len() as u64;
        } else if open.flags & libc::O_APPEND != 0 {
            attr.size = meta.len() + open.buffer.len() as u64;
        }
        // else: the ciphertext size stands until the buffer is loaded.
        Ok(attr)
    }

    fn stat_handle(&self, fh: u64) -> Result<FileAttr, libc::c_int> {
        let registry = self.registry();
        let open = registry.by_handle.get(&fh).ok_or(libc::EBADF)?;
        Self::stat_open(open)
    }

    fn stat_path(&self, path: &Path) -> Result<FileAttr, libc::c_int> {
        {
            let registry = self.registry();
            if let Some(&fh) = registry.by_path.get(path) {
                let open = registry.by_handle.get(&fh).ok_or(libc::EBADF)?;
                return Self::stat_open(open);
            }
        }
        let meta = fs::symlink_metadata(self.rebase(path)).map_err(errno)?;
        let mut attr = attr_from_metadata(&meta);
        if !self.read_enabled && attr.kind != FileType::Directory {
            // Advertise that the plaintext cannot be read back.
            attr.perm &= !0o444;
        }
        Ok(attr)
    }
}

fn attr_from_metadata(meta: &fs::Metadata) -> FileAttr {
    let time = |secs: i64| SystemTime::UNIX_EPOCH + Duration::from_secs(secs.max(0) as u64);
    let file_type = meta.file_type();
    FileAttr {
        size: meta.len(),
        blocks: meta.blocks(),
        atime: time(meta.atime()),
        mtime: time(meta.mtime()),
        ctime: time(meta.ctime()),
        crtime: SystemTime::UNIX_EPOCH,
        kind: if file_type.is_dir() {
            FileType::Directory
        } else if file_type.is_symlink() {
            FileType::Symlink
        } else if file_type.is_block_device() {
            FileType::BlockDevice
        } else if file_type.is_char_device() {
            FileType::CharDevice
        } else if file_type.is_fifo() {
            FileType::NamedPipe
        } else if file_type.is_socket() {
            FileType::Socket
        } else {
            FileType::RegularFile
        },
        perm: (meta.mode() & 0o7777) as u16,
        nlink: meta.nlink() as u32,
        uid: meta.uid(),
        gid: meta.gid(),
        rdev: meta.rdev() as u32,
        flags: 0,
    }
}

fn xattr_name(name: &OsStr) -> Result<CString, libc::c_int> {
    CString::new(name.as_bytes()).map_err(|_| libc::EINVAL)
}

fn last_errno() -> libc::c_int {
    errno(io::Error::last_os_error())
}

// --- Host binding ---

impl FilesystemMT for AsymFs {
    fn init(&self, _req: RequestInfo) -> ResultEmpty {
        debug!("init");
        self.root.metadata().map_err(errno)?;
        Ok(())
    }

    fn getattr(&self, _req: RequestInfo, path: &Path, fh: Option<u64>) -> ResultEntry {
        debug!("getattr: {:?} fh={:?}", path, fh);
        if let Some(fh) = fh {
            match self.stat_handle(fh) {
                Ok(attr) => return Ok((TTL, attr)),
                // Directory handles are not registered; fall through.
                Err(e) if e == libc::EBADF => {}
                Err(e) => return Err(e),
            }
        }
        Ok((TTL, self.stat_path(path)?))
    }

    fn chmod(&self, _req: RequestInfo, path: &Path, _fh: Option<u64>, mode: u32) -> ResultEmpty {
        debug!("chmod: {:?} mode={:o}", path, mode);
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(self.rebase(path), fs::Permissions::from_mode(mode)).map_err(errno)
    }

    fn chown(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        uid: Option<u32>,
        gid: Option<u32>,
    ) -> ResultEmpty {
        debug!("chown: {:?} uid={:?} gid={:?}", path, uid, gid);
        let c_path = self.backing_cstring(path)?;
        let rc = unsafe {
            libc::chown(
                c_path.as_ptr(),
                uid.unwrap_or(u32::MAX),
                gid.unwrap_or(u32::MAX),
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    fn truncate(&self, _req: RequestInfo, path: &Path, fh: Option<u64>, size: u64) -> ResultEmpty {
        debug!("truncate: {:?} fh={:?} size={}", path, fh, size);
        match fh {
            Some(fh) => self.truncate_handle(fh, size),
            None => self.truncate_path(path, size),
        }
    }

    fn utimens(
        &self,
        _req: RequestInfo,
        path: &Path,
        _fh: Option<u64>,
        atime: Option<SystemTime>,
        mtime: Option<SystemTime>,
    ) -> ResultEmpty {
        debug!("utimens: {:?} atime={:?} mtime={:?}", path, atime, mtime);
        let to_timespec = |t: Option<SystemTime>| match t {
            Some(ts) => {
                let d = ts
                    .duration_since(SystemTime::UNIX_EPOCH)
                    .unwrap_or(Duration::ZERO);
                libc::timespec {
                    tv_sec: d.as_secs() as libc::time_t,
                    tv_nsec: d.subsec_nanos() as libc::c_long,
                }
            }
            None => libc::timespec {
                tv_sec: 0,
                tv_nsec: libc::UTIME_OMIT,
            },
        };
        let times = [to_timespec(atime), to_timespec(mtime)];

        let mut rel = b".".to_vec();
        rel.extend_from_slice(path.as_os_str().as_bytes());
        let rel = CString::new(rel).map_err(|_| libc::EINVAL)?;
        let rc =
            unsafe { libc::utimensat(self.root.as_raw_fd(), rel.as_ptr(), times.as_ptr(), 0) };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    fn readlink(&self, _req: RequestInfo, path: &Path) -> ResultData {
        debug!("readlink: {:?}", path);
        let target = fs::read_link(self.rebase(path)).map_err(errno)?;
        Ok(target.into_os_string().into_vec())
    }

    fn mkdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr, mode: u32) -> ResultEntry {
        let path = parent.join(name);
        debug!("mkdir: {:?} mode={:o}", path, mode);
        use std::os::unix::fs::DirBuilderExt;
        fs::DirBuilder::new()
            .mode(mode)
            .create(self.rebase(&path))
            .map_err(errno)?;
        Ok((TTL, self.stat_path(&path)?))
    }

    fn unlink(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let path = parent.join(name);
        debug!("unlink: {:?}", path);
        fs::remove_file(self.rebase(&path)).map_err(errno)
    }

    fn rmdir(&self, _req: RequestInfo, parent: &Path, name: &OsStr) -> ResultEmpty {
        let path = parent.join(name);
        debug!("rmdir: {:?}", path);
        fs::remove_dir(self.rebase(&path)).map_err(errno)
    }

    fn symlink(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        target: &Path,
    ) -> ResultEntry {
        let path = parent.join(name);
        debug!("symlink: {:?} -> {:?}", path, target);
        std::os::unix::fs::symlink(target, self.rebase(&path)).map_err(errno)?;
        Ok((TTL, self.stat_path(&path)?))
    }

    fn rename(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        newparent: &Path,
        newname: &OsStr,
    ) -> ResultEmpty {
        let old = parent.join(name);
        let new = newparent.join(newname);
        debug!("rename: {:?} -> {:?}", old, new);
        self.rename_path(&old, &new)
    }

    fn link(
        &self,
        _req: RequestInfo,
        path: &Path,
        _newparent: &Path,
        _newname: &OsStr,
    ) -> ResultEntry {
        debug!("link: {:?} (refused)", path);
        // A hard link would alias one ciphertext under two paths while the
        // registry is keyed by path.
        Err(libc::EPERM)
    }

    fn open(&self, _req: RequestInfo, path: &Path, flags: u32) -> ResultOpen {
        debug!("open: {:?} flags={:#o}", path, flags);
        let fh = self.open_path(path, flags as i32)?;
        Ok((fh, flags))
    }

    fn read(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        size: u32,
        callback: impl FnOnce(ResultSlice<'_>) -> CallbackResult,
    ) -> CallbackResult {
        debug!("read: {:?} fh={} offset={} size={}", path, fh, offset, size);
        match self.read_handle(fh, offset, size) {
            Ok(data) => callback(Ok(&data)),
            Err(e) => callback(Err(e)),
        }
    }

    fn write(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        offset: u64,
        data: Vec<u8>,
        _flags: u32,
    ) -> ResultWrite {
        debug!("write: {:?} fh={} offset={} len={}", path, fh, offset, data.len());
        self.write_handle(fh, offset, &data)
    }

    fn release(
        &self,
        _req: RequestInfo,
        path: &Path,
        fh: u64,
        _flags: u32,
        _lock_owner: u64,
        _flush: bool,
    ) -> ResultEmpty {
        debug!("release: {:?} fh={}", path, fh);
        self.release_handle(fh)
    }

    fn opendir(&self, _req: RequestInfo, path: &Path, _flags: u32) -> ResultOpen {
        debug!("opendir: {:?}", path);
        fs::read_dir(self.rebase(path)).map_err(errno)?;
        Ok((0, 0))
    }

    fn readdir(&self, _req: RequestInfo, path: &Path, _fh: u64) -> ResultReaddir {
        debug!("readdir: {:?}", path);
        let mut entries = vec![
            DirectoryEntry {
                name: OsStr::new(".").to_os_string(),
                kind: FileType::Directory,
            },
            DirectoryEntry {
                name: OsStr::new("..").to_os_string(),
                kind: FileType::Directory,
            },
        ];
        for entry in fs::read_dir(self.rebase(path)).map_err(errno)? {
            let entry = entry.map_err(errno)?;
            let kind = match entry.file_type() {
                Ok(t) if t.is_dir() => FileType::Directory,
                Ok(t) if t.is_symlink() => FileType::Symlink,
                Ok(t)
                    if t.is_block_device()
                        || t.is_char_device()
                        || t.is_fifo()
                        || t.is_socket() =>
                {
                    continue
                }
                // Regular files and entries of unknown type.
                _ => FileType::RegularFile,
            };
            entries.push(DirectoryEntry {
                name: entry.file_name(),
                kind,
            });
        }
        Ok(entries)
    }

    fn releasedir(&self, _req: RequestInfo, path: &Path, _fh: u64, _flags: u32) -> ResultEmpty {
        debug!("releasedir: {:?}", path);
        Ok(())
    }

    fn statfs(&self, _req: RequestInfo, _path: &Path) -> ResultStatfs {
        debug!("statfs");
        let mut stat: libc::statvfs = unsafe { std::mem::zeroed() };
        let rc = unsafe { libc::fstatvfs(self.root.as_raw_fd(), &mut stat) };
        if rc != 0 {
            return Err(last_errno());
        }
        Ok(Statfs {
            blocks: stat.f_blocks as u64,
            bfree: stat.f_bfree as u64,
            bavail: stat.f_bavail as u64,
            files: stat.f_files as u64,
            ffree: stat.f_ffree as u64,
            bsize: stat.f_bsize as u32,
            namelen: stat.f_namemax as u32,
            frsize: stat.f_frsize as u32,
        })
    }

    fn setxattr(
        &self,
        _req: RequestInfo,
        path: &Path,
        name: &OsStr,
        value: &[u8],
        flags: u32,
        _position: u32,
    ) -> ResultEmpty {
        debug!("setxattr: {:?} name={:?}", path, name);
        let c_path = self.backing_cstring(path)?;
        let c_name = xattr_name(name)?;
        let rc = unsafe {
            libc::setxattr(
                c_path.as_ptr(),
                c_name.as_ptr(),
                value.as_ptr() as *const libc::c_void,
                value.len(),
                flags as libc::c_int,
            )
        };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    fn listxattr(&self, _req: RequestInfo, path: &Path, size: u32) -> ResultXattr {
        debug!("listxattr: {:?} size={}", path, size);
        let c_path = self.backing_cstring(path)?;
        if size == 0 {
            let len = unsafe { libc::listxattr(c_path.as_ptr(), std::ptr::null_mut(), 0) };
            if len < 0 {
                return Err(last_errno());
            }
            return Ok(Xattr::Size(len as u32));
        }
        let mut buf = vec![0u8; size as usize];
        let len = unsafe {
            libc::listxattr(c_path.as_ptr(), buf.as_mut_ptr() as *mut libc::c_char, buf.len())
        };
        if len < 0 {
            return Err(last_errno());
        }
        buf.truncate(len as usize);
        Ok(Xattr::Data(buf))
    }

    fn removexattr(&self, _req: RequestInfo, path: &Path, name: &OsStr) -> ResultEmpty {
        debug!("removexattr: {:?} name={:?}", path, name);
        let c_path = self.backing_cstring(path)?;
        let c_name = xattr_name(name)?;
        let rc = unsafe { libc::removexattr(c_path.as_ptr(), c_name.as_ptr()) };
        if rc == 0 {
            Ok(())
        } else {
            Err(last_errno())
        }
    }

    fn access(&self, _req: RequestInfo, path: &Path, mask: u32) -> ResultEmpty {
        debug!("access: {:?} mask={:#o}", path, mask);
        let c_path = self.backing_cstring(path)?;
        let rc = unsafe { libc::access(c_path.as_ptr(), mask as libc::c_int) };
        if rc != 0 {
            return Err(last_errno());
        }
        if mask & libc::R_OK as u32 != 0 && !self.read_enabled {
            return Err(libc::EACCES);
        }
        Ok(())
    }

    fn create(
        &self,
        _req: RequestInfo,
        parent: &Path,
        name: &OsStr,
        mode: u32,
        flags: u32,
    ) -> ResultCreate {
        let path = parent.join(name);
        debug!("create: {:?} mode={:o} flags={:#o}", path, mode, flags);
        let fh = self.create_file(&path, mode, flags as i32)?;
        let attr = self.stat_handle(fh)?;
        Ok(CreatedEntry {
            ttl: TTL,
            attr,
            fh,
            flags,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    // Stand-in for the external tool: same argv contract, same armor
    // framing, base64 instead of cryptography.
    const STUB_TOOL: &str = r#"#!/bin/sh
mode=$1
case "$mode" in
-d)
    sed -e '/^-----BEGIN PGP MESSAGE-----$/d' -e '/^-----END PGP MESSAGE-----$/d' | base64 -d
    ;;
-ae)
    echo "-----BEGIN PGP MESSAGE-----"
    base64
    echo "-----END PGP MESSAGE-----"
    ;;
*)
    exit 2
    ;;
esac
"#;

    struct Harness {
        dir: PathBuf,
        backing: PathBuf,
        tool: String,
    }

    impl Harness {
        fn new(name: &str) -> Self {
            let dir = PathBuf::from(format!("target/test-asymfs-{name}"));
            let _ = fs::remove_dir_all(&dir);
            let backing = dir.join("backing");
            fs::create_dir_all(&backing).unwrap();

            let tool_path = dir.join("stub-tool.sh");
            fs::write(&tool_path, STUB_TOOL).unwrap();
            let mut perms = fs::metadata(&tool_path).unwrap().permissions();
            perms.set_mode(0o755);
            fs::set_permissions(&tool_path, perms).unwrap();
            let tool = fs::canonicalize(&tool_path)
                .unwrap()
                .to_str()
                .unwrap()
                .to_string();

            Self { dir, backing, tool }
        }

        fn mount(&self, read_enabled: bool) -> AsymFs {
            let mut afs =
                AsymFs::new(&self.backing, read_enabled, GpgTool::new(self.tool.clone())).unwrap();
            afs.set_recipients(vec!["TESTKEY".to_string()]);
            afs
        }

        fn cleanup(self) {
            let _ = fs::remove_dir_all(&self.dir);
        }
    }

    fn seed(harness: &Harness, path: &str, contents: &[u8]) {
        let afs = harness.mount(true);
        let fh = afs.create_file(Path::new(path), 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh, 0, contents).unwrap();
        afs.release_handle(fh).unwrap();
    }

    #[test]
    fn round_trip_through_release() {
        let h = Harness::new("round-trip");
        let afs = h.mount(true);
        let path = Path::new("/test");

        let fh = afs.create_file(path, 0o600, libc::O_RDWR).unwrap();
        assert_eq!(afs.write_handle(fh, 0, b"abcdefg").unwrap(), 7);
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abcdefg");
        afs.release_handle(fh).unwrap();

        // The backing file holds armored ciphertext, not the plaintext.
        let raw = fs::read(h.backing.join("test")).unwrap();
        assert!(raw.windows(crypto::TERMINATOR.len()).any(|w| w == crypto::TERMINATOR));
        assert!(!raw.windows(7).any(|w| w == b"abcdefg"));

        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abcdefg");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn append_session_adds_a_block() {
        let h = Harness::new("append");
        seed(&h, "/test", b"abcdefg");
        let afs = h.mount(true);
        let path = Path::new("/test");

        let fh = afs
            .open_path(path, libc::O_WRONLY | libc::O_APPEND)
            .unwrap();
        assert_eq!(afs.write_handle(fh, 0, b"hijklmn").unwrap(), 7);
        afs.release_handle(fh).unwrap();

        // The appended tail becomes a second armored message.
        let raw = fs::read(h.backing.join("test")).unwrap();
        assert_eq!(crypto::split_blocks(&raw).len(), 2);

        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abcdefghijklmn");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn append_handle_after_read_replaces_file() {
        let h = Harness::new("append-loaded");
        seed(&h, "/test", b"abcdefg");
        let afs = h.mount(true);
        let path = Path::new("/test");

        // Reading first loads the whole plaintext, so this session's buffer
        // replaces the file rather than appending a block.
        let fh = afs
            .open_path(path, libc::O_WRONLY | libc::O_APPEND)
            .unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abcdefg");
        afs.write_handle(fh, 7, b"xyz").unwrap();
        afs.release_handle(fh).unwrap();

        let raw = fs::read(h.backing.join("test")).unwrap();
        assert_eq!(crypto::split_blocks(&raw).len(), 1);

        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abcdefgxyz");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn concurrent_opens_share_one_state() {
        let h = Harness::new("aliasing");
        let afs = h.mount(true);
        let path = Path::new("/test");

        let fh1 = afs.create_file(path, 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh1, 0, b"abcdefg").unwrap();
        let fh2 = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(fh1, fh2);
        assert_eq!(afs.read_handle(fh2, 0, 65536).unwrap(), b"abcdefg");

        // One flush, on the release that drops the last reference.
        afs.release_handle(fh1).unwrap();
        assert_eq!(fs::metadata(h.backing.join("test")).unwrap().len(), 0);
        afs.release_handle(fh2).unwrap();
        assert!(fs::metadata(h.backing.join("test")).unwrap().len() > 0);
        h.cleanup();
    }

    #[test]
    fn truncate_closed_file_to_nonzero() {
        let h = Harness::new("truncate-closed");
        seed(&h, "/test", b"abcdefg");
        let afs = h.mount(true);
        let path = Path::new("/test");

        afs.truncate_path(path, 3).unwrap();

        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abc");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn truncate_open_handle() {
        let h = Harness::new("truncate-open");
        let afs = h.mount(true);
        let path = Path::new("/test");

        let fh = afs.create_file(path, 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh, 0, b"abcdefg").unwrap();
        afs.truncate_handle(fh, 3).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abc");

        // Extension zero-fills.
        afs.truncate_handle(fh, 5).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abc\0\0");
        afs.release_handle(fh).unwrap();

        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abc\0\0");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn wronly_handle_can_truncate_nonzero() {
        let h = Harness::new("wronly-truncate");
        seed(&h, "/test", b"abcdefg");
        let afs = h.mount(true);
        let path = Path::new("/test");

        // The descriptor was promoted to O_RDWR, so the decrypt works.
        let fh = afs.open_path(path, libc::O_WRONLY).unwrap();
        afs.truncate_handle(fh, 3).unwrap();
        afs.release_handle(fh).unwrap();

        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abc");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn write_only_truncate_rules() {
        let h = Harness::new("wo-truncate");
        seed(&h, "/secret", b"abcdefg");
        let afs = h.mount(false);
        let path = Path::new("/secret");

        assert_eq!(afs.truncate_path(path, 3), Err(libc::EACCES));
        afs.truncate_path(path, 0).unwrap();
        assert_eq!(fs::metadata(h.backing.join("secret")).unwrap().len(), 0);
        h.cleanup();
    }

    #[test]
    fn write_only_denies_reading_existing_ciphertext() {
        let h = Harness::new("wo-read");
        seed(&h, "/secret", b"classified");
        let afs = h.mount(false);

        let fh = afs.open_path(Path::new("/secret"), libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536), Err(libc::EACCES));
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn write_only_fresh_file_reads_back_until_released() {
        let h = Harness::new("wo-fresh");
        let afs = h.mount(false);
        let path = Path::new("/fresh");

        let fh = afs.create_file(path, 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh, 0, b"mine").unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"mine");
        afs.release_handle(fh).unwrap();

        // Once released, the session's buffer is gone for good.
        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536), Err(libc::EACCES));
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn write_only_append_handle_is_unreadable() {
        let h = Harness::new("wo-append");
        let afs = h.mount(false);

        let fh = afs
            .create_file(Path::new("/log"), 0o600, libc::O_WRONLY | libc::O_APPEND)
            .unwrap();
        afs.write_handle(fh, 0, b"entry\n").unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536), Err(libc::EACCES));
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn write_only_stat_strips_read_bits() {
        let h = Harness::new("wo-stat");
        seed(&h, "/secret", b"classified");
        let afs = h.mount(false);

        let attr = afs.stat_path(Path::new("/secret")).unwrap();
        assert_eq!(attr.perm & 0o444, 0);

        // Directories keep their bits.
        let attr = afs.stat_path(Path::new("/")).unwrap();
        assert_eq!(attr.kind, FileType::Directory);
        assert_ne!(attr.perm & 0o444, 0);
        h.cleanup();
    }

    #[test]
    #[should_panic(expected = "changing recipients with open files")]
    fn recipient_change_with_open_file_panics() {
        let h = Harness::new("recipients");
        let mut afs = h.mount(true);
        afs.create_file(Path::new("/held"), 0o600, libc::O_RDWR).unwrap();
        afs.set_recipients(vec!["OTHERKEY".to_string()]);
    }

    #[test]
    fn release_is_idempotent() {
        let h = Harness::new("release");
        let afs = h.mount(true);

        assert_eq!(afs.release_handle(42), Ok(()));
        let fh = afs.create_file(Path::new("/once"), 0o600, libc::O_RDWR).unwrap();
        afs.release_handle(fh).unwrap();
        assert_eq!(afs.release_handle(fh), Ok(()));
        h.cleanup();
    }

    #[test]
    fn rename_rebinds_open_handle() {
        let h = Harness::new("rename");
        let afs = h.mount(true);

        let fh = afs.create_file(Path::new("/a"), 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh, 0, b"abc").unwrap();
        afs.rename_path(Path::new("/a"), Path::new("/b")).unwrap();

        assert!(!h.backing.join("a").exists());
        assert!(h.backing.join("b").exists());

        // The new name aliases the same open state.
        let fh2 = afs.open_path(Path::new("/b"), libc::O_RDONLY).unwrap();
        assert_eq!(fh, fh2);
        afs.release_handle(fh).unwrap();
        afs.release_handle(fh2).unwrap();

        let fh = afs.open_path(Path::new("/b"), libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abc");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn rename_onto_open_destination_rebinds_to_source() {
        let h = Harness::new("rename-over-open");
        let afs = h.mount(true);
        let dest = Path::new("/dest");
        let src = Path::new("/tmp-save");

        let fh_dest = afs.create_file(dest, 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh_dest, 0, b"old").unwrap();
        let fh_src = afs.create_file(src, 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh_src, 0, b"new").unwrap();

        afs.rename_path(src, dest).unwrap();

        // The destination path aliases the renamed-in handle, not the
        // displaced one.
        let fh = afs.open_path(dest, libc::O_RDONLY).unwrap();
        assert_eq!(fh, fh_src);
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"new");
        afs.release_handle(fh).unwrap();
        afs.release_handle(fh_src).unwrap();

        // Releasing the displaced handle must not drop the new binding;
        // its flush lands on the orphaned inode, not on /dest.
        afs.release_handle(fh_dest).unwrap();
        let fh = afs.open_path(dest, libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"new");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn read_past_end_and_zero_write() {
        let h = Harness::new("boundaries");
        let afs = h.mount(true);
        let path = Path::new("/test");

        let fh = afs.create_file(path, 0o600, libc::O_RDWR).unwrap();
        afs.write_handle(fh, 0, b"abc").unwrap();
        assert!(afs.read_handle(fh, 10, 65536).unwrap().is_empty());
        assert_eq!(afs.write_handle(fh, 5, b"").unwrap(), 0);
        assert_eq!(afs.read_handle(fh, 0, 65536).unwrap(), b"abc");
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn untouched_create_leaves_backing_empty() {
        let h = Harness::new("clean-create");
        let afs = h.mount(true);

        let fh = afs.create_file(Path::new("/empty"), 0o600, libc::O_RDWR).unwrap();
        afs.release_handle(fh).unwrap();
        assert_eq!(fs::metadata(h.backing.join("empty")).unwrap().len(), 0);

        // An empty backing file means empty plaintext.
        let fh = afs.open_path(Path::new("/empty"), libc::O_RDONLY).unwrap();
        assert!(afs.read_handle(fh, 0, 65536).unwrap().is_empty());
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn large_plaintext_round_trip() {
        let h = Harness::new("large");
        let afs = h.mount(true);
        let path = Path::new("/big");
        let payload: Vec<u8> = (0..(2 << 20) + 7).map(|i| (i * 31 % 251) as u8).collect();

        let fh = afs.create_file(path, 0o600, libc::O_RDWR).unwrap();
        assert_eq!(
            afs.write_handle(fh, 0, &payload).unwrap(),
            payload.len() as u32
        );
        afs.release_handle(fh).unwrap();

        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        let mut collected = Vec::new();
        while let Ok(chunk) = afs.read_handle(fh, collected.len() as u64, 1 << 16) {
            if chunk.is_empty() {
                break;
            }
            collected.extend_from_slice(&chunk);
        }
        assert_eq!(collected, payload);
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn getattr_reports_plaintext_sizes() {
        let h = Harness::new("sizes");
        seed(&h, "/test", b"abcdefg");
        let afs = h.mount(true);
        let path = Path::new("/test");
        let ciphertext_len = fs::metadata(h.backing.join("test")).unwrap().len();

        // Unloaded, non-append: the ciphertext size stands.
        let fh = afs.open_path(path, libc::O_RDONLY).unwrap();
        assert_eq!(afs.stat_handle(fh).unwrap().size, ciphertext_len);
        afs.read_handle(fh, 0, 1).unwrap();
        assert_eq!(afs.stat_handle(fh).unwrap().size, 7);
        afs.release_handle(fh).unwrap();

        // Append: backing size plus the accumulated tail.
        let fh = afs
            .open_path(path, libc::O_WRONLY | libc::O_APPEND)
            .unwrap();
        afs.write_handle(fh, 0, b"hij").unwrap();
        assert_eq!(afs.stat_handle(fh).unwrap().size, ciphertext_len + 3);
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn decrypt_failure_reports_io_error() {
        let h = Harness::new("bad-ciphertext");
        let afs = h.mount(true);
        fs::write(h.backing.join("bad"), b"this is not armored at all!").unwrap();

        let fh = afs.open_path(Path::new("/bad"), libc::O_RDONLY).unwrap();
        assert_eq!(afs.read_handle(fh, 0, 65536), Err(libc::EIO));
        // The buffer was not marked loaded; the next read retries the load.
        assert_eq!(afs.read_handle(fh, 0, 65536), Err(libc::EIO));
        afs.release_handle(fh).unwrap();
        h.cleanup();
    }

    #[test]
    fn missing_path_is_not_found() {
        let h = Harness::new("missing");
        let afs = h.mount(true);
        assert!(matches!(afs.stat_path(Path::new("/nope")), Err(libc::ENOENT)));
        assert_eq!(
            afs.open_path(Path::new("/nope"), libc::O_RDONLY),
            Err(libc::ENOENT)
        );
        h.cleanup();
    }

    #[test]
    fn ready_requires_recipients() {
        let h = Harness::new("ready");
        let mut afs =
            AsymFs::new(&h.backing, true, GpgTool::new(h.tool.clone())).unwrap();
        assert!(!afs.ready());
        afs.set_recipients(vec!["TESTKEY".to_string()]);
        assert!(afs.ready());
        h.cleanup();
    }
}
