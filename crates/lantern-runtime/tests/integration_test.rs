//! Integration tests for lantern-runtime.
//!
//! These tests cover:
//! - Options manifest loading from disk
//! - Load policy combined with module resolution
//! - Capability manifest lookups used by context builders

use lantern_runtime::capability::{lookup, namespaces};
use lantern_runtime::{
    Capability, ChunkCompiler, EmbeddedBundles, LimitPolicy, Lookup, ModuleResolver,
    ModuleSource, OptionKind, OptionValue, OptionsManifest, SafeLoader, SandboxError,
    SandboxResult,
};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tempfile::TempDir;

// ==============================================================================
// Test Fixture Helpers
// ==============================================================================

/// Write an options manifest into `dir`.
fn write_manifest(dir: &Path, content: &str) -> PathBuf {
    let path = dir.join("menu.toml");
    let mut file = std::fs::File::create(&path).unwrap();
    file.write_all(content.as_bytes()).unwrap();
    path
}

/// A module source backed by a map, standing in for the node directory.
struct MapSource {
    files: HashMap<String, Vec<u8>>,
}

impl ModuleSource for MapSource {
    fn name(&self) -> &str {
        "files"
    }

    fn lookup(&self, module: &str) -> SandboxResult<Lookup> {
        let file = format!("{module}.lua");
        match self.files.get(&file) {
            Some(bytes) => Ok(Lookup::Found {
                label: file,
                source: bytes.clone(),
            }),
            None => Ok(Lookup::NotFound(format!(
                "no file '{file}' in node directory"
            ))),
        }
    }
}

/// Compiler that just reports the chunk length.
struct LengthCompiler;

impl ChunkCompiler for LengthCompiler {
    type Unit = usize;

    fn compile(&self, source: &[u8], _label: &str, _text_only: bool) -> SandboxResult<usize> {
        Ok(source.len())
    }
}

fn resolver_with(files: &[(&str, &[u8])]) -> ModuleResolver {
    let mut bundles = EmbeddedBundles::new();
    bundles.insert("class", "return {}");

    ModuleResolver::new()
        .with_source(Box::new(MapSource {
            files: files
                .iter()
                .map(|(name, bytes)| (name.to_string(), bytes.to_vec()))
                .collect(),
        }))
        .with_source(Box::new(bundles))
}

// ==============================================================================
// Options Manifest Tests
// ==============================================================================

#[test]
fn test_manifest_from_file() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_manifest(
        temp_dir.path(),
        r#"
[[option]]
name = "title"
type = "string"
default = "lobby"

[[option]]
name = "brightness"
type = "number"
param = "<0-100>"
default = 80
"#,
    );

    let manifest = OptionsManifest::from_file(&path).unwrap();
    assert_eq!(manifest.menu.title, "lantern");

    let title = manifest.get("title").unwrap();
    assert_eq!(title.kind, OptionKind::String);
    assert_eq!(
        title.initial_value().unwrap(),
        Some(OptionValue::String("lobby".to_string()))
    );

    let brightness = manifest.get("brightness").unwrap();
    assert_eq!(brightness.placeholder(), "<0-100>");
}

#[test]
fn test_manifest_missing_file() {
    let temp_dir = TempDir::new().unwrap();
    let result = OptionsManifest::from_file(&temp_dir.path().join("nope.toml"));
    assert!(matches!(result, Err(SandboxError::Io(_))));
}

#[test]
fn test_manifest_invalid_toml() {
    let temp_dir = TempDir::new().unwrap();
    let path = write_manifest(temp_dir.path(), "[[option]\nname = ");
    let result = OptionsManifest::from_file(&path);
    assert!(matches!(result, Err(SandboxError::InvalidManifest(_))));
}

// ==============================================================================
// Resolution + Load Policy Tests
// ==============================================================================

#[test]
fn test_resolved_file_still_subject_to_policy() {
    let resolver = resolver_with(&[("evil.lua", b"\x1bLua\x54")]);
    let loader = SafeLoader::new(LengthCompiler);

    let (label, source) = resolver.resolve("evil").unwrap();
    let err = loader.compile(&source, &label, false).unwrap_err();
    assert_eq!(
        err.to_string(),
        "precompiled code not allowed for chunk 'evil.lua'"
    );
}

#[test]
fn test_file_shadows_embedded_bundle() {
    let resolver = resolver_with(&[("class.lua", b"return 'local'")]);
    let (label, source) = resolver.resolve("class").unwrap();
    assert_eq!(label, "class.lua");
    assert_eq!(source, b"return 'local'");
}

#[test]
fn test_missing_module_reports_every_source() {
    let resolver = resolver_with(&[]);
    let err = resolver.resolve("missing").unwrap_err();

    let message = err.to_string();
    let lines: Vec<&str> = message.lines().collect();
    assert_eq!(lines[0], "module 'missing' not found:");
    assert_eq!(lines[1], "\tno file 'missing.lua' in node directory");
    assert_eq!(lines[2], "\tno embedded module 'missing'");
    assert_eq!(lines.len(), 3);
}

// ==============================================================================
// Capability Manifest Tests
// ==============================================================================

#[test]
fn test_manifest_exposes_host_namespaces() {
    let names = namespaces();
    for expected in ["string", "table", "math", "resource", "gl", "sys", "node"] {
        assert!(names.contains(&expected), "missing namespace {expected}");
    }
}

#[test]
fn test_string_pattern_functions_are_limited() {
    for symbol in ["find", "match", "gmatch", "format"] {
        let entry = lookup(Some("string"), symbol).unwrap();
        assert_eq!(
            entry.capability,
            Capability::Limited(LimitPolicy::MaxSubjectLen(32768)),
            "string.{symbol}"
        );
    }

    let gsub = lookup(Some("string"), "gsub").unwrap();
    assert_eq!(
        gsub.capability,
        Capability::Limited(LimitPolicy::MaxReplaceOutput {
            subject: 32768,
            output: 1024 * 1024,
        })
    );
}
