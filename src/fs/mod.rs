use std::{
    collections::HashMap,
    fs::{self, File, OpenOptions},
    io::{Read, Seek, SeekFrom, Write},
    path::{Path, PathBuf},
    sync::Arc,
};

use anyhow::{anyhow, bail};
use parking_lot::Mutex;

pub trait DbFile: std::fmt::Debug + Send {
    // Appends at the file's write position.
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()>;
    fn sync(&mut self) -> anyhow::Result<()>;
    fn read_all(&self) -> anyhow::Result<Vec<u8>>;
    fn len(&self) -> usize;
}

/// A flat directory of named files. Everything the engine persists goes
/// through this, so tests can swap in [`MockDir`].
pub trait DbDir: Clone + std::fmt::Debug + Send + Sync + 'static {
    type DbFile: DbFile;

    fn unlink<P>(&self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>;

    fn ls(&self) -> anyhow::Result<Vec<String>>;

    // Returns None if the file already exists.
    fn create<P>(&self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>;

    fn open<P>(&self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>;

    // Replaces `to` if it exists.
    fn rename<P, Q>(&self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>;
}

fn path_str<P: AsRef<Path>>(p: &P) -> anyhow::Result<String> {
    p.as_ref()
        .to_str()
        .map(str::to_owned)
        .ok_or_else(|| anyhow!("non-utf8 path {:?}", p.as_ref()))
}

// OS Implementation
#[derive(Debug)]
pub struct OsFile {
    file: File,
    path: PathBuf,
}

impl DbFile for OsFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        self.file.write_all(buf)?;
        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    fn read_all(&self) -> anyhow::Result<Vec<u8>> {
        let mut f = &self.file;
        let pos = f.stream_position()?;
        f.seek(SeekFrom::Start(0))?;
        let mut data = Vec::new();
        let read = f.read_to_end(&mut data);
        f.seek(SeekFrom::Start(pos))?;
        read.map_err(|e| anyhow!("reading {:?}: {}", self.path, e))?;
        Ok(data)
    }

    fn len(&self) -> usize {
        self.file.metadata().map(|m| m.len() as usize).unwrap_or(0)
    }
}

#[derive(Clone, Debug)]
pub struct OsDir {
    root: PathBuf,
}

impl OsDir {
    pub fn new<P: Into<PathBuf>>(root: P) -> anyhow::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        Ok(OsDir { root })
    }
}

impl DbDir for OsDir {
    type DbFile = OsFile;

    fn unlink<P>(&self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        match fs::remove_file(self.root.join(fname)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    fn ls(&self) -> anyhow::Result<Vec<String>> {
        let mut names = Vec::new();
        for entry in fs::read_dir(&self.root)? {
            let entry = entry?;
            if entry.file_type()?.is_file() {
                names.push(path_str(&entry.file_name())?);
            }
        }
        names.sort();
        Ok(names)
    }

    fn create<P>(&self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let path = self.root.join(fname);
        match OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(&path)
        {
            Ok(file) => Ok(Some(OsFile { file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn open<P>(&self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let path = self.root.join(fname);
        match OpenOptions::new().read(true).append(true).open(&path) {
            Ok(file) => Ok(Some(OsFile { file, path })),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    fn rename<P, Q>(&self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        fs::rename(self.root.join(from), self.root.join(to))?;
        File::open(&self.root)?.sync_all()?;
        Ok(())
    }
}

// Mock Implementation
#[derive(Default, Debug)]
struct MockData {
    synced: Vec<u8>,
    unsynced: Vec<u8>,
}

#[derive(Clone, Debug)]
pub struct MockFile {
    idx: usize,
    pub file_id: FileId,
    fs: Arc<Mutex<MockFs>>,
}

impl MockFile {
    #[allow(unused)]
    fn read_all_synced(&self) -> Vec<u8> {
        self.fs.lock().data[self.file_id].synced.clone()
    }
}

impl DbFile for MockFile {
    fn write(&mut self, buf: &[u8]) -> anyhow::Result<()> {
        let data = buf.to_vec();
        self.fs.lock().write(self.file_id, self.idx, data)?;
        self.idx += buf.len();

        Ok(())
    }

    fn sync(&mut self) -> anyhow::Result<()> {
        self.fs.lock().sync(self.file_id)?;
        Ok(())
    }

    fn read_all(&self) -> anyhow::Result<Vec<u8>> {
        self.fs.lock().read(self.file_id)
    }

    fn len(&self) -> usize {
        self.fs.lock().stat(self.file_id).len
    }
}

struct FileMeta {
    len: usize,
}

#[derive(Clone, Debug)]
pub struct MockDir {
    pub fs: Arc<Mutex<MockFs>>,
}

impl MockDir {
    pub fn new() -> Self {
        MockDir {
            fs: Arc::new(Mutex::new(MockFs::new())),
        }
    }
}

impl Default for MockDir {
    fn default() -> Self {
        MockDir::new()
    }
}

impl DbDir for MockDir {
    type DbFile = MockFile;

    fn unlink<P>(&self, fname: &P) -> anyhow::Result<bool>
    where
        P: AsRef<Path>,
    {
        self.fs.lock().unlink(&path_str(fname)?)
    }

    fn ls(&self) -> anyhow::Result<Vec<String>> {
        let mut fs = self.fs.lock();
        fs.check_crashed()?;
        let mut fnames: Vec<String> = fs.names.keys().cloned().collect();
        fnames.sort();
        fs.record(Event::Ls(fnames.clone()));
        Ok(fnames)
    }

    fn create<P>(&self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        Ok(self
            .fs
            .lock()
            .create(&path_str(fname)?)?
            .map(|file_id| MockFile {
                fs: self.fs.clone(),
                file_id,
                idx: 0,
            }))
    }

    fn open<P>(&self, fname: &P) -> anyhow::Result<Option<Self::DbFile>>
    where
        P: AsRef<Path>,
    {
        let mut fs = self.fs.lock();
        Ok(fs.open(&path_str(fname)?)?.map(|file_id| MockFile {
            idx: fs.stat(file_id).len,
            fs: self.fs.clone(),
            file_id,
        }))
    }

    fn rename<P, Q>(&self, from: &P, to: &Q) -> anyhow::Result<()>
    where
        P: AsRef<Path>,
        Q: AsRef<Path>,
    {
        self.fs.lock().rename(&path_str(from)?, &path_str(to)?)
    }
}

type FileId = usize;

#[derive(Debug, Clone)]
pub enum Event {
    Create(String, FileId),
    Write(FileId, usize, Vec<u8>),
    Sync(FileId),
    Rename(String, String),
    Unlink(String),
    Open(String),
    Read(FileId),
    Ls(Vec<String>),
}

impl Event {
    // Like Debug, but writes are shown by length instead of contents.
    pub fn write_abbrev<W: std::fmt::Write>(&self, w: &mut W) -> std::fmt::Result {
        match self {
            Event::Create(name, file_id) => write!(w, "Create({}, {})", name, file_id),
            Event::Write(file_id, idx, contents) => {
                write!(w, "Write({}, {}, {} bytes)", file_id, idx, contents.len())
            }
            Event::Sync(file_id) => write!(w, "Sync({})", file_id),
            Event::Rename(from, to) => write!(w, "Rename({}, {})", from, to),
            Event::Unlink(name) => write!(w, "Unlink({})", name),
            Event::Open(name) => write!(w, "Open({})", name),
            Event::Read(file_id) => write!(w, "Read({})", file_id),
            Event::Ls(names) => write!(w, "Ls() -> {:?}", names),
        }
    }
}

#[derive(Debug)]
pub struct MockFs {
    names: HashMap<String, FileId>,
    data: Vec<MockData>,
    events: Vec<Event>,

    // After this many "things happen," "crash" the FS, meaning stop accepting
    // any operation (reads included) and discard any unsynced data on reboot.
    time_to_crash: Option<usize>,
}

impl MockFs {
    fn new() -> Self {
        MockFs {
            names: HashMap::new(),
            data: Vec::new(),
            events: Vec::new(),
            time_to_crash: None,
        }
    }

    fn check_crashed(&self) -> anyhow::Result<()> {
        if self.time_to_crash == Some(0) {
            bail!("filesystem is down")
        } else {
            Ok(())
        }
    }

    pub fn schedule_crash(&mut self, ops: usize) {
        self.time_to_crash = Some(ops);
    }

    // Discard all unsynced state, become uncrashed.
    pub fn reboot(&mut self) {
        for f in self.data.iter_mut() {
            f.unsynced.clear();
            f.unsynced.extend(&f.synced);
        }
        self.time_to_crash = None;
    }

    fn perform_op(&mut self) -> anyhow::Result<()> {
        self.check_crashed()?;
        if let Some(x) = self.time_to_crash {
            self.time_to_crash = Some(x - 1);
        }
        Ok(())
    }

    fn record(&mut self, e: Event) {
        self.events.push(e);
    }

    pub fn iter_events(&self) -> impl Iterator<Item = &Event> {
        self.events.iter()
    }

    pub fn take_events(&mut self) -> Vec<Event> {
        std::mem::take(&mut self.events)
    }

    pub fn file_names(&self) -> Vec<String> {
        let mut names: Vec<_> = self.names.keys().cloned().collect();
        names.sort();
        names
    }

    fn stat(&self, file: FileId) -> FileMeta {
        FileMeta {
            len: self.data[file].unsynced.len(),
        }
    }
}

impl MockFs {
    fn create(&mut self, path: &str) -> anyhow::Result<Option<FileId>> {
        self.perform_op()?;

        if self.names.contains_key(path) {
            return Ok(None);
        }
        let id = self.data.len();
        self.record(Event::Create(path.to_owned(), id));
        self.names.insert(path.to_owned(), id);
        self.data.push(MockData::default());

        Ok(Some(id))
    }

    fn unlink(&mut self, path: &str) -> anyhow::Result<bool> {
        self.perform_op()?;

        self.record(Event::Unlink(path.to_owned()));
        Ok(self.names.remove(path).is_some())
    }

    fn open(&mut self, path: &str) -> anyhow::Result<Option<FileId>> {
        self.check_crashed()?;
        self.record(Event::Open(path.to_owned()));
        Ok(self.names.get(path).cloned())
    }

    fn read(&mut self, file: FileId) -> anyhow::Result<Vec<u8>> {
        self.check_crashed()?;
        self.record(Event::Read(file));
        Ok(self.data[file].unsynced.clone())
    }

    fn rename(&mut self, from: &str, to: &str) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::Rename(from.to_owned(), to.to_owned()));

        match self.names.remove(from) {
            Some(d) => {
                self.names.insert(to.to_owned(), d);
                Ok(())
            }
            None => bail!("rename of missing file {}", from),
        }
    }

    fn write(&mut self, file: FileId, idx: usize, data: Vec<u8>) -> anyhow::Result<()> {
        self.perform_op()?;

        let end = idx + data.len();
        let contents = &mut self.data[file].unsynced;
        if contents.len() < end {
            contents.resize(end, 0);
        }
        contents[idx..end].copy_from_slice(&data);

        self.record(Event::Write(file, idx, data));
        Ok(())
    }

    fn sync(&mut self, file: FileId) -> anyhow::Result<()> {
        self.perform_op()?;

        self.record(Event::Sync(file));
        let d = &mut self.data[file];
        d.synced.clone_from(&d.unsynced);

        Ok(())
    }
}
