//! Host functions backed by a real node directory.
//!
//! The node sees a flat namespace: every name a script passes must be a
//! plain file name inside the node directory. Drawing is headless; draw
//! operations are counted and traced at `trace` level on the `draw` target.

use lantern_node::{ClientId, DrawOp, HostFunctions, ResourceInfo, ResourceRequest};
use lantern_runtime::{SandboxError, SandboxResult};
use std::cell::{Cell, RefCell};
use std::collections::{HashMap, HashSet};
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, trace, warn};

/// [`HostFunctions`] over a directory on disk.
pub struct DirectoryHost {
    root: PathBuf,
    display: (u32, u32),
    started: Instant,
    features: HashSet<String>,
    next_resource: Cell<u64>,
    resources: RefCell<HashMap<u64, ResourceRequest>>,
    frame_ops: Cell<u64>,
    console: RefCell<Box<dyn Write>>,
}

impl DirectoryHost {
    pub fn new(root: impl Into<PathBuf>, display: (u32, u32)) -> Self {
        Self {
            root: root.into(),
            display,
            started: Instant::now(),
            features: ["headless"].iter().map(|f| f.to_string()).collect(),
            next_resource: Cell::new(0),
            resources: RefCell::new(HashMap::new()),
            frame_ops: Cell::new(0),
            console: RefCell::new(Box::new(io::stdout())),
        }
    }

    /// Send client output somewhere other than stdout.
    pub fn with_console(self, console: Box<dyn Write>) -> Self {
        *self.console.borrow_mut() = console;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Resources created and not yet released.
    pub fn live_resources(&self) -> usize {
        self.resources.borrow().len()
    }

    /// Draw operations since the last call.
    pub fn take_frame_ops(&self) -> u64 {
        self.frame_ops.replace(0)
    }

    /// Map a script-supplied name onto a path in the node directory.
    pub fn resolve(&self, name: &str) -> SandboxResult<PathBuf> {
        if name.is_empty() || name.contains(['/', '\\', '\0']) || name.starts_with('.') {
            return Err(SandboxError::Host(format!("invalid file name '{}'", name)));
        }
        Ok(self.root.join(name))
    }
}

impl HostFunctions for DirectoryHost {
    fn read_file(&self, name: &str) -> SandboxResult<Option<Vec<u8>>> {
        let path = self.resolve(name)?;
        match fs::read(&path) {
            Ok(content) => Ok(Some(content)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(e) => Err(SandboxError::Io(format!("{}: {}", path.display(), e))),
        }
    }

    fn load_resource(&self, request: &ResourceRequest) -> SandboxResult<ResourceInfo> {
        if let Some(file) = request.file() {
            if !self.resolve(file)?.is_file() {
                return Err(SandboxError::Host(format!("no such file '{}'", file)));
            }
        }

        let (width, height) = match request {
            ResourceRequest::Snapshot => self.display,
            ResourceRequest::ColoredTexture { .. } => (1, 1),
            _ => (0, 0),
        };

        let id = self.next_resource.get() + 1;
        self.next_resource.set(id);
        self.resources.borrow_mut().insert(id, request.clone());
        debug!(id, kind = request.kind(), "Resource created");

        Ok(ResourceInfo { id, width, height })
    }

    fn release_resource(&self, id: u64) {
        if let Some(request) = self.resources.borrow_mut().remove(&id) {
            debug!(id, kind = request.kind(), "Resource released");
        }
    }

    fn draw(&self, op: DrawOp) {
        self.frame_ops.set(self.frame_ops.get() + 1);
        trace!(target: "draw", ?op);
    }

    fn now(&self) -> f64 {
        self.started.elapsed().as_secs_f64()
    }

    fn env(&self, key: &str) -> Option<String> {
        std::env::var(key).ok()
    }

    fn provides(&self, feature: &str) -> bool {
        self.features.contains(feature)
    }

    fn client_write(&self, client: ClientId, data: &str) {
        let mut console = self.console.borrow_mut();
        if let Err(e) = console.write_all(data.as_bytes()).and_then(|_| console.flush()) {
            warn!(client, "Failed to write client output: {}", e);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::rc::Rc;

    struct SharedBuffer(Rc<RefCell<Vec<u8>>>);

    impl Write for SharedBuffer {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.0.borrow_mut().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_read_file() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("node.lua"), "x = 1").unwrap();

        let host = DirectoryHost::new(dir.path(), (800, 600));
        assert_eq!(host.read_file("node.lua").unwrap(), Some(b"x = 1".to_vec()));
        assert_eq!(host.read_file("missing.lua").unwrap(), None);
    }

    #[test]
    fn test_traversal_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let host = DirectoryHost::new(dir.path(), (800, 600));

        for name in ["../secret", "sub/file", "..", ".hidden", "", "a\\b"] {
            let err = host.read_file(name).unwrap_err();
            assert!(matches!(err, SandboxError::Host(_)), "{name:?}");
        }
    }

    #[test]
    fn test_resources() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("logo.png"), [0u8; 4]).unwrap();
        let host = DirectoryHost::new(dir.path(), (800, 600));

        let image = host
            .load_resource(&ResourceRequest::Image {
                name: "logo.png".to_string(),
            })
            .unwrap();
        let snapshot = host.load_resource(&ResourceRequest::Snapshot).unwrap();
        assert_eq!((snapshot.width, snapshot.height), (800, 600));
        assert_ne!(image.id, snapshot.id);
        assert_eq!(host.live_resources(), 2);

        host.release_resource(image.id);
        host.release_resource(image.id);
        assert_eq!(host.live_resources(), 1);

        let missing = host.load_resource(&ResourceRequest::Font {
            name: "missing.ttf".to_string(),
        });
        assert!(missing.is_err());
    }

    #[test]
    fn test_client_write_goes_to_console() {
        let dir = tempfile::tempdir().unwrap();
        let buffer = Rc::new(RefCell::new(Vec::new()));
        let host = DirectoryHost::new(dir.path(), (800, 600))
            .with_console(Box::new(SharedBuffer(Rc::clone(&buffer))));

        host.client_write(0, "hello\n");
        assert_eq!(buffer.borrow().as_slice(), b"hello\n");
    }

    #[test]
    fn test_draw_ops_counted() {
        let dir = tempfile::tempdir().unwrap();
        let host = DirectoryHost::new(dir.path(), (800, 600));
        host.draw(DrawOp::PushMatrix);
        host.draw(DrawOp::PopMatrix);
        assert_eq!(host.take_frame_ops(), 2);
        assert_eq!(host.take_frame_ops(), 0);
        assert!(host.provides("headless"));
        assert!(!host.provides("gpu"));
    }
}
