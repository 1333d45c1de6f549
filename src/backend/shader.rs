// Shader module loading and hot reload
//
// Shader binaries are opaque SPIR-V blobs read from disk; checking their
// contents is the driver's job. The watcher only reports that a blob changed.

use ash::vk;
use notify::{EventKind, RecursiveMode, Watcher};
use std::io::Cursor;
use std::path::{Path, PathBuf};
use std::sync::mpsc::{channel, Receiver};

use crate::error::{RenderError, Result, VkResultExt};

/// Vertex + fragment blob locations.
#[derive(Clone, Debug)]
pub struct ShaderPaths {
    pub vertex: PathBuf,
    pub fragment: PathBuf,
}

/// Read a whole shader file into memory.
pub fn read_shader_file(path: &Path) -> Result<Vec<u8>> {
    std::fs::read(path).map_err(|source| RenderError::ShaderIo {
        path: path.to_path_buf(),
        source,
    })
}

/// Create a shader module from SPIR-V bytes.
pub fn create_shader_module(device: &ash::Device, code: &[u8], path: &Path) -> Result<vk::ShaderModule> {
    // SPIR-V is 4-byte words; read_spv copies into aligned storage
    let words = ash::util::read_spv(&mut Cursor::new(code)).map_err(|source| RenderError::ShaderIo {
        path: path.to_path_buf(),
        source,
    })?;

    let create_info = vk::ShaderModuleCreateInfo::builder().code(&words);

    unsafe { device.create_shader_module(&create_info, None) }.during("Create shader module")
}

/// A vertex/fragment module pair, destroyed when dropped.
pub struct ShaderStages<'a> {
    device: &'a ash::Device,
    pub vertex: vk::ShaderModule,
    pub fragment: vk::ShaderModule,
}

impl<'a> ShaderStages<'a> {
    pub fn load(device: &'a ash::Device, paths: &ShaderPaths) -> Result<Self> {
        let vertex_code = read_shader_file(&paths.vertex)?;
        let fragment_code = read_shader_file(&paths.fragment)?;

        let mut stages = Self {
            device,
            vertex: vk::ShaderModule::null(),
            fragment: vk::ShaderModule::null(),
        };
        stages.vertex = create_shader_module(device, &vertex_code, &paths.vertex)?;
        stages.fragment = create_shader_module(device, &fragment_code, &paths.fragment)?;

        log::debug!("Loaded shaders {:?} and {:?}", paths.vertex, paths.fragment);
        Ok(stages)
    }
}

impl Drop for ShaderStages<'_> {
    fn drop(&mut self) {
        unsafe {
            if self.vertex != vk::ShaderModule::null() {
                self.device.destroy_shader_module(self.vertex, None);
            }
            if self.fragment != vk::ShaderModule::null() {
                self.device.destroy_shader_module(self.fragment, None);
            }
        }
    }
}

/// Does this file event write or create one of `files`?
pub fn event_touches(event: &notify::Event, files: &[PathBuf]) -> bool {
    matches!(event.kind, EventKind::Modify(_) | EventKind::Create(_))
        && event.paths.iter().any(|p| files.iter().any(|f| p == f))
}

/// Watches the shader blobs for changes.
pub struct ShaderWatcher {
    _watcher: notify::RecommendedWatcher,
    events: Receiver<notify::Result<notify::Event>>,
    files: Vec<PathBuf>,
}

impl ShaderWatcher {
    pub fn new(paths: &ShaderPaths) -> Result<Self> {
        let (tx, rx) = channel();
        let mut watcher = notify::recommended_watcher(tx)?;

        let mut files = Vec::new();
        for path in [&paths.vertex, &paths.fragment] {
            let file = std::fs::canonicalize(path).map_err(|source| RenderError::ShaderIo {
                path: path.clone(),
                source,
            })?;
            // Watch the directory: compilers usually replace the file
            let dir = file.parent().unwrap_or(Path::new("."));
            watcher.watch(dir, RecursiveMode::NonRecursive)?;
            files.push(file);
        }

        log::info!("Watching shaders for changes: {:?}", files);
        Ok(Self {
            _watcher: watcher,
            events: rx,
            files,
        })
    }

    /// Drain pending events; true if any touched a watched shader.
    pub fn poll_changed(&self) -> bool {
        let mut changed = false;
        for event in self.events.try_iter() {
            match event {
                Ok(event) => changed |= event_touches(&event, &self.files),
                Err(e) => log::warn!("Shader watcher error: {}", e),
            }
        }
        changed
    }
}
