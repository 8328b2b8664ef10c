// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

const SHADERS: &[&str] = &["shaders/instance.vert", "shaders/instance.frag"];

fn main() {
    println!("cargo:rerun-if-changed=shaders/");

    // Compile shaders using glslc (part of Vulkan SDK)
    for shader in SHADERS {
        compile_shader(shader, &format!("{shader}.spv"));
    }
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    // Ray queries need the Vulkan 1.2+ SPIR-V environment
    let result = Command::new("glslc")
        .arg("--target-env=vulkan1.3")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    // The renderer still runs without shaders (frames are only cleared), so
    // a failed compile is a warning rather than a build failure.
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!("cargo:warning=Failed to compile {}: exit code {:?}", input, status.code());
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({e}); compile manually with:");
            println!("cargo:warning=  glslc --target-env=vulkan1.3 {} -o {}", input, output);
        }
    }
}
