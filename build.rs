// Build script to compile GLSL shaders to SPIR-V

use std::path::Path;
use std::process::Command;

fn main() {
    println!("cargo:rerun-if-changed=shaders/shader.vert");
    println!("cargo:rerun-if-changed=shaders/shader.frag");

    // Compile shaders using glslc (part of Vulkan SDK)
    compile_shader("shaders/shader.vert", "shaders/shader.vert.spv");
    compile_shader("shaders/shader.frag", "shaders/shader.frag.spv");
}

fn compile_shader(input: &str, output: &str) {
    let input_path = Path::new(input);
    let output_path = Path::new(output);

    let result = Command::new("glslc")
        .arg(input_path)
        .arg("-o")
        .arg(output_path)
        .status();

    // The renderer reads the .spv files at startup, so a missing compiler only
    // matters if they were never built
    match result {
        Ok(status) if status.success() => {}
        Ok(status) => {
            println!(
                "cargo:warning=glslc failed on {} (exit code {:?})",
                input,
                status.code()
            );
        }
        Err(e) => {
            println!("cargo:warning=glslc not found ({}); compile manually:", e);
            println!("cargo:warning=  glslc {} -o {}", input, output);
        }
    }
}
