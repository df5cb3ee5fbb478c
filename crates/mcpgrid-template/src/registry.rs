//! On-disk template registry.
//!
//! Walks a root directory once at construction; each subdirectory holding a
//! `template.json` / `template.yaml` / `template.yml` descriptor becomes one
//! template. The registry is the sole source of template identity — every
//! other component receives resolved descriptors from here.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, RwLock};

use tracing::{debug, warn};

use crate::descriptor::{TemplateDescriptor, TemplateOrigin};
use crate::error::{TemplateError, TemplateResult};

const DESCRIPTOR_NAMES: &[&str] = &["template.json", "template.yaml", "template.yml"];

/// Thread-safe registry of template descriptors loaded from disk.
#[derive(Debug)]
pub struct TemplateRegistry {
    root: PathBuf,
    templates: RwLock<HashMap<String, Arc<TemplateDescriptor>>>,
    /// Bumped on every `refresh()`; lets caches detect template changes.
    generation: std::sync::atomic::AtomicU64,
}

impl TemplateRegistry {
    /// Load all templates under `root`.
    ///
    /// A missing root yields an empty registry; a malformed descriptor is a
    /// hard error so that a typo cannot silently drop a template.
    pub fn load(root: impl Into<PathBuf>) -> TemplateResult<Self> {
        let root = root.into();
        let templates = scan(&root)?;
        debug!(root = %root.display(), count = templates.len(), "template registry loaded");
        Ok(Self {
            root,
            templates: RwLock::new(templates),
            generation: std::sync::atomic::AtomicU64::new(0),
        })
    }

    /// All template ids, sorted.
    pub fn list(&self) -> Vec<String> {
        let templates = self.templates.read().expect("template map lock");
        let mut ids: Vec<String> = templates.keys().cloned().collect();
        ids.sort();
        ids
    }

    /// All descriptors, sorted by id.
    pub fn list_descriptors(&self) -> Vec<Arc<TemplateDescriptor>> {
        let templates = self.templates.read().expect("template map lock");
        let mut all: Vec<Arc<TemplateDescriptor>> = templates.values().cloned().collect();
        all.sort_by(|a, b| a.id.cmp(&b.id));
        all
    }

    /// Resolve a template by id.
    pub fn get(&self, id: &str) -> TemplateResult<Arc<TemplateDescriptor>> {
        let templates = self.templates.read().expect("template map lock");
        templates
            .get(id)
            .cloned()
            .ok_or_else(|| TemplateError::NotFound(id.to_string()))
    }

    /// Re-read the template tree from disk, replacing the in-memory set.
    pub fn refresh(&self) -> TemplateResult<()> {
        let fresh = scan(&self.root)?;
        let mut templates = self.templates.write().expect("template map lock");
        *templates = fresh;
        self.generation
            .fetch_add(1, std::sync::atomic::Ordering::SeqCst);
        debug!(count = templates.len(), "template registry refreshed");
        Ok(())
    }

    /// Current refresh generation. Changes whenever `refresh()` runs.
    pub fn generation(&self) -> u64 {
        self.generation.load(std::sync::atomic::Ordering::SeqCst)
    }

    /// The registry's root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }
}

fn scan(root: &Path) -> TemplateResult<HashMap<String, Arc<TemplateDescriptor>>> {
    let mut templates = HashMap::new();
    if !root.exists() {
        warn!(root = %root.display(), "template root does not exist, starting empty");
        return Ok(templates);
    }

    let entries = std::fs::read_dir(root).map_err(|source| TemplateError::Io {
        path: root.to_path_buf(),
        source,
    })?;

    for entry in entries {
        let entry = entry.map_err(|source| TemplateError::Io {
            path: root.to_path_buf(),
            source,
        })?;
        let dir = entry.path();
        if !dir.is_dir() {
            continue;
        }

        let Some(descriptor_path) = DESCRIPTOR_NAMES
            .iter()
            .map(|name| dir.join(name))
            .find(|p| p.is_file())
        else {
            debug!(dir = %dir.display(), "no descriptor file, skipping directory");
            continue;
        };

        let template = load_descriptor(&descriptor_path)?;
        templates.insert(template.id.clone(), Arc::new(template));
    }

    Ok(templates)
}

fn load_descriptor(path: &Path) -> TemplateResult<TemplateDescriptor> {
    let raw = std::fs::read_to_string(path).map_err(|source| TemplateError::Io {
        path: path.to_path_buf(),
        source,
    })?;

    let mut template: TemplateDescriptor = if path.extension().is_some_and(|e| e == "json") {
        serde_json::from_str(&raw).map_err(|e| TemplateError::Invalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    } else {
        serde_yaml::from_str(&raw).map_err(|e| TemplateError::Invalid {
            path: path.to_path_buf(),
            message: e.to_string(),
        })?
    };

    template.validate().map_err(|message| TemplateError::Invalid {
        path: path.to_path_buf(),
        message,
    })?;

    // The directory name is authoritative for identity.
    if let Some(dir_name) = path.parent().and_then(|d| d.file_name()) {
        if dir_name.to_string_lossy() != template.id {
            return Err(TemplateError::Invalid {
                path: path.to_path_buf(),
                message: format!(
                    "id: '{}' does not match directory name '{}'",
                    template.id,
                    dir_name.to_string_lossy()
                ),
            });
        }
    }

    template.origin = TemplateOrigin::BuiltIn;
    Ok(template)
}
