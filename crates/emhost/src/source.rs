//! Module acquisition: read or fetch the binary, then compile it, either
//! inline or on a worker thread.

use std::path::PathBuf;
use std::sync::mpsc;
use std::thread;

use anyhow::{anyhow, bail, Context, Result};
use wasmtime::{Engine, Module};

const WASM_MAGIC: &[u8; 4] = b"\0asm";

/// Where the module binary comes from.
#[derive(Debug, Clone)]
pub enum ModuleSource {
    Path(PathBuf),
    Url(String),
    Bytes(Vec<u8>),
}

impl ModuleSource {
    /// `http://` and `https://` arguments are URLs; anything else is a path.
    pub fn from_arg(arg: &str) -> Self {
        if arg.starts_with("http://") || arg.starts_with("https://") {
            ModuleSource::Url(arg.to_string())
        } else {
            ModuleSource::Path(PathBuf::from(arg))
        }
    }

    /// Apply a `locate_resource` rewrite to paths and URLs.
    pub fn locate(self, locate: Option<&(dyn Fn(&str) -> String + Send)>) -> Self {
        let Some(locate) = locate else {
            return self;
        };
        match self {
            ModuleSource::Path(path) => {
                ModuleSource::from_arg(&locate(&path.to_string_lossy()))
            }
            ModuleSource::Url(url) => ModuleSource::from_arg(&locate(&url)),
            bytes => bytes,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            ModuleSource::Path(path) => path.display().to_string(),
            ModuleSource::Url(url) => url.clone(),
            ModuleSource::Bytes(bytes) => format!("<{} bytes>", bytes.len()),
        }
    }

    /// Produce the module bytes.
    pub fn read(self) -> Result<Vec<u8>> {
        match self {
            ModuleSource::Path(path) => {
                std::fs::read(&path).with_context(|| format!("failed to read {}", path.display()))
            }
            ModuleSource::Url(url) => fetch(&url),
            ModuleSource::Bytes(bytes) => Ok(bytes),
        }
    }
}

#[cfg(feature = "fetch")]
fn fetch(url: &str) -> Result<Vec<u8>> {
    match fetch_streaming(url) {
        Ok(bytes) => Ok(bytes),
        Err(err) => {
            log::warn!("wasm streaming compile failed: {err:#}");
            log::warn!("falling back to buffered instantiation");
            fetch_buffered(url)
        }
    }
}

#[cfg(not(feature = "fetch"))]
fn fetch(url: &str) -> Result<Vec<u8>> {
    bail!("cannot load {url}: emhost was built without the `fetch` feature")
}

/// Read the response incrementally, rejecting it as soon as the MIME type
/// or the header shows it is not a WebAssembly binary.
#[cfg(feature = "fetch")]
fn fetch_streaming(url: &str) -> Result<Vec<u8>> {
    use std::io::Read;

    let resp = ureq::get(url).call().with_context(|| format!("GET {url}"))?;
    let mime = resp
        .headers()
        .get("content-type")
        .and_then(|value| value.to_str().ok())
        .unwrap_or_default()
        .to_string();
    if !mime.starts_with("application/wasm") {
        bail!("incorrect response MIME type {mime:?}, expected \"application/wasm\"");
    }

    let mut reader = resp.into_body().into_reader();
    let mut bytes = Vec::new();
    let mut chunk = [0u8; 16 * 1024];
    loop {
        let n = reader.read(&mut chunk).context("read http response body")?;
        if n == 0 {
            break;
        }
        bytes.extend_from_slice(&chunk[..n]);
        if bytes.len() >= WASM_MAGIC.len() && !bytes.starts_with(WASM_MAGIC) {
            bail!("response from {url} is not a WebAssembly binary");
        }
    }
    Ok(bytes)
}

#[cfg(feature = "fetch")]
fn fetch_buffered(url: &str) -> Result<Vec<u8>> {
    use std::io::Read;

    let resp = ureq::get(url).call().with_context(|| format!("GET {url}"))?;
    let mut reader = resp.into_body().into_reader();
    let mut bytes = Vec::new();
    reader
        .read_to_end(&mut bytes)
        .context("read http response body")?;
    Ok(bytes)
}

/// A compiled module together with the bytes it came from.
pub(crate) struct Loaded {
    pub bytes: Vec<u8>,
    pub module: Module,
}

pub(crate) fn compile(engine: &Engine, source: ModuleSource) -> Result<Loaded> {
    let name = source.describe();
    let bytes = source.read()?;
    if !bytes.starts_with(WASM_MAGIC) {
        bail!("{name} is not a WebAssembly binary");
    }
    let module = Module::from_binary(engine, &bytes)
        .with_context(|| format!("failed to compile {name}"))?;
    log::info!("compiled {name} ({} bytes)", bytes.len());
    Ok(Loaded { bytes, module })
}

/// A module being acquired and compiled on a worker thread.
pub(crate) struct PendingModule {
    receiver: mpsc::Receiver<Result<Loaded>>,
}

impl PendingModule {
    pub(crate) fn spawn(engine: Engine, source: ModuleSource) -> Result<Self> {
        let (sender, receiver) = mpsc::channel();
        thread::Builder::new()
            .name("emhost-loader".into())
            .spawn(move || {
                // The receiver may be gone if the runtime was dropped.
                let _ = sender.send(compile(&engine, source));
            })
            .context("failed to spawn module loader thread")?;
        Ok(Self { receiver })
    }

    /// `None` while the worker is still busy.
    pub(crate) fn try_take(&self) -> Option<Result<Loaded>> {
        match self.receiver.try_recv() {
            Ok(loaded) => Some(loaded),
            Err(mpsc::TryRecvError::Empty) => None,
            Err(mpsc::TryRecvError::Disconnected) => Some(Err(anyhow!(
                "module loader thread exited without a result"
            ))),
        }
    }

    pub(crate) fn wait(&self) -> Result<Loaded> {
        self.receiver
            .recv()
            .map_err(|_| anyhow!("module loader thread exited without a result"))?
    }
}
