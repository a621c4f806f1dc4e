#![allow(dead_code)]

pub use bidstrack_test_utils::builders;
pub use bidstrack_test_utils::init_tracing;

use bidstrack_test_utils::builders::{DatasetFixture, DescriptorBuilder, ManifestBuilder};
use serde_json::{json, Value};

pub const MRIQC: (&str, &str) = ("mriqc", "23.1.0");

/// `mriqc <bids_dir> <output_dir> participant --participant-label <label>`
pub fn mriqc_descriptor() -> DescriptorBuilder {
    DescriptorBuilder::new("mriqc")
        .command_line("mriqc [BIDS] [OUT] participant [LABEL] [NPROCS]")
        .file_input("bids_dir", "[BIDS]")
        .file_output("output_dir", "[OUT]")
        .input(json!({
            "id": "participant_label",
            "type": "String",
            "value-key": "[LABEL]",
            "command-line-flag": "--participant-label"
        }))
        .input(json!({
            "id": "nprocs",
            "type": "Number",
            "value-key": "[NPROCS]",
            "command-line-flag": "--nprocs",
            "optional": true
        }))
}

pub fn mriqc_template() -> Value {
    json!({
        "bids_dir": "[[BIDS_DIR]]",
        "output_dir": "[[OUTPUT_DIR]]",
        "participant_label": "[[PARTICIPANT_LABEL]]"
    })
}

/// Two units in the manifest and raw data; only sub-01 is in BIDS and
/// processed by mriqc.
pub fn two_unit_dataset() -> DatasetFixture {
    let mut ds = DatasetFixture::new();
    ds.write_manifest(
        ManifestBuilder::new()
            .unit("01", "01", &["anat"])
            .unit("02", "01", &["anat"]),
    );
    ds.add_raw("01", "01");
    ds.add_raw("02", "01");
    ds.add_bids("01", "01", &["anat/sub-01_ses-01_T1w.nii.gz"]);
    ds.add_derivative(MRIQC.0, MRIQC.1, "01", "01");
    ds.add_pipeline(MRIQC.0, MRIQC.1, &mriqc_descriptor(), mriqc_template());
    ds
}
