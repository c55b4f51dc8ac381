// build.rs
// Compiles the GLSL sources in shaders/ into SPIR-V under assets/shaders/

use std::env;
use std::path::{Path, PathBuf};
use std::process::Command;

const SHADER_STAGES: [&str; 3] = ["vert", "frag", "comp"];

/// Output name keeps the stage: `quad.vert` -> `quad.vert.spv`
fn spirv_path(source: &Path, target_dir: &Path) -> Option<PathBuf> {
    let file_name = source.file_name()?.to_str()?;
    Some(target_dir.join(format!("{}.spv", file_name)))
}

fn is_stale(source: &Path, output: &Path) -> bool {
    match (
        std::fs::metadata(source).and_then(|m| m.modified()),
        std::fs::metadata(output).and_then(|m| m.modified()),
    ) {
        (Ok(src), Ok(dst)) => src > dst,
        _ => true,
    }
}

fn compile_shaders(shader_dir: &Path, target_dir: &Path, glslc: &Path) -> usize {
    let entries = match std::fs::read_dir(shader_dir) {
        Ok(entries) => entries,
        Err(_) => {
            println!("cargo:warning=No shader directory at {}", shader_dir.display());
            return 0;
        }
    };

    let mut compiled = 0;
    for path in entries.filter_map(Result::ok).map(|entry| entry.path()) {
        let is_stage = path
            .extension()
            .and_then(|ext| ext.to_str())
            .map_or(false, |ext| SHADER_STAGES.contains(&ext));
        if !is_stage {
            continue;
        }
        let Some(output) = spirv_path(&path, target_dir) else {
            continue;
        };
        if !is_stale(&path, &output) {
            continue;
        }

        let status = Command::new(glslc)
            .arg("-I")
            .arg(shader_dir)
            .arg(&path)
            .arg("-o")
            .arg(&output)
            .status();

        match status {
            Ok(status) if status.success() => compiled += 1,
            Ok(status) => panic!(
                "glslc failed for {} with exit code {}",
                path.display(),
                status.code().unwrap_or(-1)
            ),
            Err(err) => panic!("Failed to run glslc for {}: {}", path.display(), err),
        }
    }
    compiled
}

fn main() {
    println!("cargo:rerun-if-changed=shaders");
    println!("cargo:rerun-if-env-changed=VULKAN_SDK");
    println!("cargo:rerun-if-env-changed=SKIP_SHADERS");

    if env::var_os("SKIP_SHADERS").is_some() {
        return;
    }

    let Some(vulkan_sdk) = env::var_os("VULKAN_SDK") else {
        println!("cargo:warning=VULKAN_SDK not set, shader compilation skipped");
        return;
    };

    let glslc = if cfg!(target_os = "windows") {
        Path::new(&vulkan_sdk).join("Bin").join("glslc.exe")
    } else {
        Path::new(&vulkan_sdk).join("bin").join("glslc")
    };
    if !glslc.exists() {
        println!("cargo:warning=glslc not found at {}, shader compilation skipped", glslc.display());
        return;
    }

    let manifest_dir = PathBuf::from(env::var_os("CARGO_MANIFEST_DIR").unwrap_or_default());
    let shader_dir = manifest_dir.join("shaders");
    let target_dir = manifest_dir.join("assets").join("shaders");
    if let Err(err) = std::fs::create_dir_all(&target_dir) {
        println!("cargo:warning=Failed to create {}: {}", target_dir.display(), err);
        return;
    }

    let compiled = compile_shaders(&shader_dir, &target_dir, &glslc);
    if compiled > 0 {
        println!("cargo:warning=Compiled {} shader(s)", compiled);
    }
}
