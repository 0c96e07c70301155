use minijinja::{Environment, context};
use std::env;
use std::fs;
use std::path::Path;
use serde::{Deserialize, Serialize};

#[derive(Debug, Deserialize, Serialize)]
struct FormatInfo {
    name: String,
    vendor: String,
    rust: String,
    bytes: usize,
}

#[derive(Debug, Deserialize, Serialize)]
struct FormatList {
    formats: Vec<FormatInfo>,
}

fn main() {
    // Read the yaml file
    let yaml_path = Path::new("../supported_formats.yaml");
    let yaml_str = fs::read_to_string(yaml_path)
        .expect("Unable to read supported_formats.yaml");
    let format_list: FormatList = serde_yaml::from_str(&yaml_str)
        .expect("Failed to parse YAML");

    // Load the template from a file
    let template_path = Path::new("templates/data_formats.jinja");
    let template_source = fs::read_to_string(template_path)
        .expect("Unable to read template file");

    let env = Environment::new();
    let tmpl = env.template_from_str(&template_source).unwrap();

    let rendered = tmpl.render(context! { formats => format_list.formats }).unwrap();

    let out_dir = env::var("OUT_DIR").expect("OUT_DIR not set by cargo");
    fs::write(Path::new(&out_dir).join("generated_data_formats.rs"), rendered)
        .expect("Unable to write generated file");

    // Tell cargo to rerun if files change
    println!("cargo:rerun-if-changed=../supported_formats.yaml");
    println!("cargo:rerun-if-changed=templates/data_formats.jinja");
}
