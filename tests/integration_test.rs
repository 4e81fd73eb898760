// Integration tests for georecall

use std::collections::HashMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use candle_core::{DType, Device, Tensor};
use clap::Parser;
use georecall::cli::{Cli, Command as CliCommand, EvalArgs};
use georecall::config::ModelConfig;
use georecall::core::Pca;
use georecall::models::{GeoLocalizationNet, StateDict};
use georecall::storage::RecallReport;

fn georecall(args: &[&str], cwd: &Path) -> Output {
    Command::new(env!("CARGO_BIN_EXE_georecall"))
        .args(args)
        .current_dir(cwd)
        .output()
        .expect("Failed to run georecall")
}

fn scratch(name: &str) -> PathBuf {
    let root = std::env::temp_dir().join(format!("georecall_it_{}_{}", name, std::process::id()));
    let _ = fs::remove_dir_all(&root);
    fs::create_dir_all(&root).unwrap();
    root
}

fn write_image(path: &Path, shade: u8) {
    fs::create_dir_all(path.parent().unwrap()).unwrap();
    let img = image::RgbImage::from_fn(48, 40, |x, y| {
        image::Rgb([shade, (x * 5) as u8, (y * 6) as u8])
    });
    img.save(path).unwrap();
}

fn eval_args(extra: &[&str]) -> EvalArgs {
    let mut argv = vec!["georecall", "eval"];
    argv.extend_from_slice(extra);
    let CliCommand::Eval(args) = Cli::try_parse_from(argv).unwrap().command else {
        panic!("expected eval");
    };
    args
}

/// Seeded resnet18conv4 + GeM weights under the model's own names
fn seeded_weights() -> StateDict {
    let config = ModelConfig::from_args(&eval_args(&["--backbone", "resnet18conv4", "--aggregation", "gem"])).unwrap();
    let specs = GeoLocalizationNet::layout(&config).unwrap();
    StateDict::initialized(&specs, 7).unwrap()
}

/// Write a seeded resnet18conv4 + GeM checkpoint as safetensors
fn write_checkpoint(path: &Path) {
    let tensors: HashMap<String, Tensor> = seeded_weights()
        .iter()
        .map(|(name, tensor)| (format!("module.{}", name), tensor.clone()))
        .collect();
    candle_core::safetensors::save(&tensors, path).unwrap();
}

/// Write a seeded resnet18conv4 + GeM training checkpoint the way torch.save does
fn write_pickle_checkpoint(path: &Path) {
    let entries: Vec<(String, Tensor)> = seeded_weights()
        .iter()
        .map(|(name, tensor)| (format!("module.{}", name), tensor.clone()))
        .collect();
    write_torch_checkpoint(path, "model_state_dict", &entries);
}

fn push_text(out: &mut Vec<u8>, text: &str) {
    out.push(b'X');
    out.extend_from_slice(&(text.len() as u32).to_le_bytes());
    out.extend_from_slice(text.as_bytes());
}

fn push_global(out: &mut Vec<u8>, module: &str, name: &str) {
    out.push(b'c');
    out.extend_from_slice(format!("{}\n{}\n", module, name).as_bytes());
}

fn push_int(out: &mut Vec<u8>, value: usize) {
    out.push(b'J');
    out.extend_from_slice(&(value as i32).to_le_bytes());
}

fn push_ints(out: &mut Vec<u8>, values: &[usize]) {
    out.push(b'(');
    for &v in values {
        push_int(out, v);
    }
    out.push(b't');
}

/// `{key: OrderedDict(entries)}` in the zip container of torch.save
fn write_torch_checkpoint(path: &Path, key: &str, entries: &[(String, Tensor)]) {
    let mut pickle = vec![0x80, 2, b'}', b'('];
    push_text(&mut pickle, key);
    push_global(&mut pickle, "collections", "OrderedDict");
    pickle.extend_from_slice(b")R(");

    let mut storages = Vec::new();
    for (i, (name, tensor)) in entries.iter().enumerate() {
        let flat = tensor.flatten_all().unwrap();
        let (class, bytes): (&str, Vec<u8>) = match tensor.dtype() {
            DType::I64 => ("LongStorage", flat.to_vec1::<i64>().unwrap().iter().flat_map(|v| v.to_le_bytes()).collect()),
            _ => ("FloatStorage", flat.to_vec1::<f32>().unwrap().iter().flat_map(|v| v.to_le_bytes()).collect()),
        };
        let dims = tensor.dims();
        let mut strides = vec![1usize; dims.len()];
        for d in (0..dims.len().saturating_sub(1)).rev() {
            strides[d] = strides[d + 1] * dims[d + 1];
        }

        push_text(&mut pickle, name);
        push_global(&mut pickle, "torch._utils", "_rebuild_tensor_v2");
        pickle.extend_from_slice(b"((");
        push_text(&mut pickle, "storage");
        push_global(&mut pickle, "torch", class);
        push_text(&mut pickle, &i.to_string());
        push_text(&mut pickle, "cpu");
        push_int(&mut pickle, tensor.elem_count());
        pickle.extend_from_slice(b"tQ");
        push_int(&mut pickle, 0);
        push_ints(&mut pickle, dims);
        push_ints(&mut pickle, &strides);
        pickle.push(0x89);
        push_global(&mut pickle, "collections", "OrderedDict");
        pickle.extend_from_slice(b")RtR");
        storages.push(bytes);
    }
    pickle.extend_from_slice(b"uu.");

    let mut writer = zip::ZipWriter::new(fs::File::create(path).unwrap());
    let options = zip::write::SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
    writer.start_file("best_model/data.pkl", options).unwrap();
    writer.write_all(&pickle).unwrap();
    for (i, bytes) in storages.iter().enumerate() {
        writer.start_file(format!("best_model/data/{}", i), options).unwrap();
        writer.write_all(bytes).unwrap();
    }
    writer.finish().unwrap();
}

/// Two database images and one query within 25 m of the first
fn write_tiny_dataset(root: &Path) {
    let test = root.join("datasets").join("tiny").join("images").join("test");
    write_image(&test.join("database").join("@100.0@200.0@.jpg"), 10);
    write_image(&test.join("database").join("@900.0@900.0@.jpg"), 200);
    write_image(&test.join("queries").join("@105.0@200.0@.jpg"), 20);
}

fn read_report(path: &Path) -> RecallReport {
    serde_json::from_str(&fs::read_to_string(path).unwrap()).unwrap()
}

fn assert_success(output: &Output) {
    assert!(
        output.status.success(),
        "Eval failed:\n{}\n{}",
        String::from_utf8_lossy(&output.stdout),
        String::from_utf8_lossy(&output.stderr)
    );
}

fn find_report(root: &Path) -> PathBuf {
    walkdir::WalkDir::new(root)
        .into_iter()
        .filter_map(|e| e.ok())
        .map(|e| e.into_path())
        .find(|p| p.file_name().and_then(|n| n.to_str()) == Some("recalls.json"))
        .expect("Expected recalls.json to be written")
}

#[test]
fn test_help_display() {
    let output = georecall(&["--help"], &std::env::temp_dir());
    assert!(output.status.success(), "Help command failed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("eval") && stdout.contains("fetch"),
            "Expected eval and fetch in help output");
}

#[test]
fn test_version_display() {
    let output = georecall(&["--version"], &std::env::temp_dir());
    assert!(output.status.success(), "Version command failed");

    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("georecall"), "Expected 'georecall' in version output");
}

#[test]
fn test_unknown_off_the_shelf_fails() {
    let root = scratch("unknown_source");
    let output = georecall(&["eval", "--off-the-shelf", "dino"], &root);

    assert!(!output.status.success(), "Unknown weights source should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("Unknown off-the-shelf source"), "Unexpected output:\n{}", stderr);
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_fetch_without_published_weights_fails() {
    let root = scratch("fetch");
    let output = georecall(
        &["fetch", "--off-the-shelf", "radenovic_sfm", "--backbone", "resnet18conv4", "--weights-dir", "w"],
        &root,
    );

    assert!(!output.status.success(), "resnet18 has no Radenovic weights");
    assert!(!root.join("w").exists(), "Nothing should be downloaded");
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_zero_recall_value_fails() {
    let root = scratch("recall_values");
    let output = georecall(&["eval", "--recall-values", "0,5"], &root);

    assert!(!output.status.success(), "Zero recall value should fail");
    assert!(!root.join("test").exists(), "No run directory before validation");
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_invalid_model_config_creates_no_run_dir() {
    let root = scratch("model_config");
    let output = georecall(&["eval", "--aggregation", "netvlad", "--fc-output-dim", "8"], &root);

    assert!(!output.status.success(), "fc on netvlad should fail");
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("--fc-output-dim"), "Unexpected output:\n{}", stderr);
    assert!(!root.join("test").exists(), "No run directory before validation");
    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_eval_resumed_checkpoint() {
    let root = scratch("eval");
    let checkpoint = root.join("best_model.safetensors");
    write_checkpoint(&checkpoint);
    write_tiny_dataset(&root);

    let output = georecall(
        &[
            "eval",
            "--backbone", "resnet18conv4",
            "--aggregation", "gem",
            "--resume", checkpoint.to_str().unwrap(),
            "--datasets-folder", "datasets",
            "--dataset-name", "tiny",
            "--resize", "64", "64",
            "--recall-values", "1,2",
            "--device", "cpu",
            "--save-dir", "it",
        ],
        &root,
    );
    assert_success(&output);
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("R@1:"), "Expected recalls in output:\n{}", stdout);

    let report_path = find_report(&root.join("test").join("it"));
    let report = read_report(&report_path);
    assert_eq!(report.dataset, "tiny");
    assert_eq!(report.features_dim, 256);
    assert_eq!(report.recalls.values, vec![1, 2]);
    assert_eq!(report.recalls.percentages[1], 100.0);
    assert!(report.comparison.is_none());
    assert!(report_path.with_file_name("info.log").exists());

    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_eval_fits_saves_and_reloads_pca() {
    let root = scratch("pca");
    let checkpoint = root.join("best_model.pth");
    write_pickle_checkpoint(&checkpoint);
    write_tiny_dataset(&root);
    let train = root.join("datasets").join("tiny").join("images").join("train");
    for shade in 0..6u8 {
        write_image(&train.join(format!("@{}.0@0.0@.jpg", shade)), shade * 40);
    }

    let common = [
        "eval",
        "--backbone", "resnet18conv4",
        "--aggregation", "gem",
        "--resume", checkpoint.to_str().unwrap(),
        "--datasets-folder", "datasets",
        "--dataset-name", "tiny",
        "--resize", "64", "64",
        "--recall-values", "1,2",
        "--device", "cpu",
    ];
    let run = |extra: &[&str]| {
        let mut argv = common.to_vec();
        argv.extend_from_slice(extra);
        georecall(&argv, &root)
    };

    // Fit on the train folder
    let output = run(&["--pca-dim", "4", "--pca-dataset-folder", "tiny/images/train", "--save-dir", "fit"]);
    assert_success(&output);
    let report_path = find_report(&root.join("test").join("fit"));
    assert_eq!(read_report(&report_path).features_dim, 4);
    let pca_path = report_path.with_file_name("pca.msgpack");
    assert!(pca_path.exists(), "Expected the fitted PCA to be saved");

    // Reuse the saved PCA
    let output = run(&["--pca-path", pca_path.to_str().unwrap(), "--save-dir", "reuse"]);
    assert_success(&output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Loaded PCA (256 -> 4)"));
    assert_eq!(read_report(&find_report(&root.join("test").join("reuse"))).features_dim, 4);

    // --pca-dim must agree with the saved components
    let output = run(&["--pca-path", pca_path.to_str().unwrap(), "--pca-dim", "3", "--save-dir", "bad_dim"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("does not match the 4 components"), "Unexpected output:\n{}", stderr);

    // and the saved PCA must fit the model's descriptors
    let data = ndarray::Array2::from_shape_fn((10, 32), |(i, j)| ((i * 7 + j * 3) % 11) as f32);
    let foreign = Pca::fit(data.view(), 2, false, 0).unwrap();
    georecall::storage::save_pca(&foreign, &root.join("foreign")).unwrap();
    let output = run(&["--pca-path", "foreign/pca.msgpack", "--save-dir", "bad_model"]);
    assert!(!output.status.success());
    let stderr = String::from_utf8_lossy(&output.stderr);
    assert!(stderr.contains("expects 32-dimensional descriptors"), "Unexpected output:\n{}", stderr);

    // PCA without a source folder
    let output = run(&["--pca-dim", "4", "--save-dir", "no_folder"]);
    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains("--pca-dataset-folder"));

    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_eval_comparison_writes_both_reports() {
    let root = scratch("comparison");
    let checkpoint = root.join("best_model.pth");
    write_pickle_checkpoint(&checkpoint);
    write_tiny_dataset(&root);

    let output = georecall(
        &[
            "eval",
            "--backbone", "resnet18conv4",
            "--aggregation", "gem",
            "--resume", checkpoint.to_str().unwrap(),
            "--comparison",
            "--resume-compar", checkpoint.to_str().unwrap(),
            "--datasets-folder", "datasets",
            "--dataset-name", "tiny",
            "--resize", "64", "64",
            "--recall-values", "1,2",
            "--device", "cpu",
            "--save-dir", "first",
            "--save-alt-dir", "second",
        ],
        &root,
    );
    assert_success(&output);
    assert!(String::from_utf8_lossy(&output.stdout).contains("Ensemble R@1"));

    let report = read_report(&find_report(&root.join("test").join("first")));
    let comparison = report.comparison.expect("Expected the comparison results");
    assert_eq!(comparison.recalls.values, vec![1, 2]);
    assert_eq!(comparison.ensemble.values, vec![1, 2]);
    // Same weights on both sides
    assert_eq!(comparison.recalls.percentages, report.recalls.percentages);

    let second = read_report(&find_report(&root.join("test").join("second")));
    assert_eq!(second.features_dim, 256);
    assert!(second.comparison.is_none());

    fs::remove_dir_all(&root).unwrap();
}

#[test]
fn test_radenovic_checkpoint_maps_positionally() {
    let root = scratch("radenovic");
    let weights = root.join("w");
    fs::create_dir_all(&weights).unwrap();
    georecall::config::set_weights_dir(weights.clone());

    let args = eval_args(&[
        "--backbone", "resnet50conv5",
        "--aggregation", "gem",
        "--fc-output-dim", "2048",
        "--off-the-shelf", "radenovic_sfm",
    ]);
    let config = ModelConfig::from_args(&args).unwrap();
    let specs = GeoLocalizationNet::layout(&config).unwrap();
    let dict = StateDict::initialized(&specs, 11).unwrap();

    // Stored under other names, with batch-norm counters in between
    let mut entries = Vec::new();
    for (name, tensor) in dict.iter() {
        let stored = name
            .replace("backbone.", "features.")
            .replace("aggregation.0.0.", "pool.")
            .replace("aggregation.1.", "whiten.");
        entries.push((stored.clone(), tensor.clone()));
        if stored.ends_with("running_var") {
            let counter = Tensor::new(3i64, &Device::Cpu).unwrap();
            entries.push((stored.replace("running_var", "num_batches_tracked"), counter));
        }
    }
    // Cached download, so nothing is fetched
    write_torch_checkpoint(&weights.join("rSfM120k-tl-resnet50-gem-w-97bf910.pth"), "state_dict", &entries);

    let loaded = GeoLocalizationNet::load(&config, &Device::Cpu, 0).unwrap();
    let reference = GeoLocalizationNet::from_state_dict(&config, &dict, &Device::Cpu).unwrap();
    let images = Tensor::rand(-1f32, 1f32, (1, 3, 64, 64), &Device::Cpu).unwrap();
    let ours = loaded.forward(&images).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    let expected = reference.forward(&images).unwrap().flatten_all().unwrap().to_vec1::<f32>().unwrap();
    assert_eq!(ours.len(), 2048);
    let diff = ours.iter().zip(&expected).map(|(a, b)| (a - b).abs()).fold(0.0f32, f32::max);
    assert!(diff < 1e-5, "Descriptors differ by {}", diff);

    fs::remove_dir_all(&root).unwrap();
}
