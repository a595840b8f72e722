// Copyright (c) 2025 Erick Bourgeois, firestoned
// SPDX-License-Identifier: MIT

//! CRD YAML Generator
//!
//! Generates the `Setting` CRD YAML from the Rust type defined in src/crd.rs.
//! The legacy API version is emitted next to the current one (served, not stored)
//! so clusters that still hold legacy objects keep serving them until the
//! upgrade converts them.
//!
//! Usage:
//!   cargo run --bin crdgen
//!
//! Generated files will be written to deploy/crds/ with proper headers.

use kube::CustomResourceExt;
use serde_json::Value;
use std::fs;
use std::path::Path;
use storage_upgrade::constants::{API_GROUP, CRD_API_VERSION_V1BETA1, CURRENT_CRD_API_VERSION};
use storage_upgrade::crd::Setting;

const COPYRIGHT_HEADER: &str = "# Copyright (c) 2025 Erick Bourgeois, firestoned
# SPDX-License-Identifier: MIT
#
# This file is AUTO-GENERATED from src/crd.rs
# DO NOT EDIT MANUALLY - Run `cargo run --bin crdgen` to regenerate
#
";

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let output_dir = Path::new("deploy/crds");

    fs::create_dir_all(output_dir)?;

    println!("Generating CRD YAML files from src/crd.rs...");

    generate_crd::<Setting>("settings.crd.yaml", output_dir)?;

    println!("✓ Successfully generated CRD YAML files in deploy/crds/");
    println!("\nNext steps:");
    println!("  1. Review the generated files");
    println!("  2. Deploy with: kubectl apply -f deploy/crds/");

    Ok(())
}

fn generate_crd<T>(filename: &str, output_dir: &Path) -> Result<(), Box<dyn std::error::Error>>
where
    T: CustomResourceExt,
{
    let crd = T::crd();

    let mut crd_json: Value = serde_json::to_value(&crd)?;

    if let Some(versions) = crd_json["spec"]["versions"].as_array_mut() {
        if let Some(current) = versions.first_mut() {
            current["storage"] = Value::Bool(true);
            current["served"] = Value::Bool(true);
        }

        if let Some(mut legacy) = versions.first().cloned() {
            legacy["name"] = Value::String(CRD_API_VERSION_V1BETA1.to_string());
            legacy["storage"] = Value::Bool(false);
            legacy["deprecated"] = Value::Bool(true);
            legacy["deprecationWarning"] = Value::String(format!(
                "{API_GROUP}/{CRD_API_VERSION_V1BETA1} is deprecated. Use {API_GROUP}/{CURRENT_CRD_API_VERSION} instead."
            ));

            // Oldest version first
            versions.insert(0, legacy);
        }
    }

    let yaml = serde_yaml::to_string(&crd_json)?;

    let content = format!("{COPYRIGHT_HEADER}{yaml}");

    let output_path = output_dir.join(filename);
    fs::write(&output_path, content)?;

    println!("  ✓ Generated {filename}");

    Ok(())
}
