//! Argv-style command specification for the inference toolchain.
//!
//! Every child process (local inference, the HTTP server's per-request
//! inference, the supervised server itself) is described by an
//! [`InferenceCommand`]. Arguments are discrete elements; nothing is ever
//! passed through a shell.

use crate::error::ProcessError;
use std::collections::BTreeMap;
use std::ffi::{OsStr, OsString};
use std::path::{Path, PathBuf};

/// Environment variable that controls which GPUs the ML toolchain can see.
pub const GPU_VISIBILITY_VAR: &str = "CUDA_VISIBLE_DEVICES";

/// Maximum number of input volumes accepted by the inference script.
pub const MAX_INPUT_IMAGES: usize = 4;

/// Command line to execute, plus environment overrides.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InferenceCommand {
    pub program: OsString,
    pub args: Vec<OsString>,
    pub env: BTreeMap<OsString, OsString>,
    pub cwd: Option<PathBuf>,
}

impl InferenceCommand {
    #[must_use]
    pub fn new(program: impl Into<OsString>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
        }
    }

    #[must_use]
    pub fn arg(mut self, arg: impl Into<OsString>) -> Self {
        self.args.push(arg.into());
        self
    }

    #[must_use]
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<OsString>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    #[must_use]
    pub fn env(mut self, key: impl Into<OsString>, value: impl Into<OsString>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Merge a set of environment overrides on top of the existing ones.
    #[must_use]
    pub fn envs<I, K, V>(mut self, vars: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<OsString>,
        V: Into<OsString>,
    {
        for (k, v) in vars {
            self.env.insert(k.into(), v.into());
        }
        self
    }

    #[must_use]
    pub fn cwd(mut self, dir: impl Into<PathBuf>) -> Self {
        self.cwd = Some(dir.into());
        self
    }

    /// Hide all GPUs from the child so the toolchain falls back to CPU.
    #[must_use]
    pub fn force_cpu(self) -> Self {
        self.env(GPU_VISIBILITY_VAR, "-1")
    }

    /// Build the segmentation inference command line:
    ///
    /// `<python> <script> --model-file M --image-file I1 [--image-file-2 I2 ...] --result-file R`
    pub fn segmentation(
        python: impl Into<OsString>,
        script: &Path,
        model_file: &Path,
        inputs: &[PathBuf],
        result_file: &Path,
    ) -> Result<Self, ProcessError> {
        if inputs.is_empty() || inputs.len() > MAX_INPUT_IMAGES {
            return Err(ProcessError::InvalidInputCount {
                count: inputs.len(),
            });
        }

        let mut cmd = Self::new(python)
            .arg(script)
            .arg("--model-file")
            .arg(model_file);
        for (index, input) in inputs.iter().enumerate() {
            cmd = cmd.arg(image_file_flag(index)).arg(input);
        }
        Ok(cmd.arg("--result-file").arg(result_file))
    }

    pub fn program_name(&self) -> String {
        self.program.to_string_lossy().into_owned()
    }

    /// Human-readable rendering for logs. Not suitable for execution.
    pub fn display(&self) -> String {
        std::iter::once(self.program.as_os_str())
            .chain(self.args.iter().map(OsString::as_os_str))
            .map(OsStr::to_string_lossy)
            .collect::<Vec<_>>()
            .join(" ")
    }

    pub fn to_std(&self) -> std::process::Command {
        let mut cmd = std::process::Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }

    pub fn to_tokio(&self) -> tokio::process::Command {
        let mut cmd = tokio::process::Command::new(&self.program);
        cmd.args(&self.args).envs(&self.env);
        if let Some(dir) = &self.cwd {
            cmd.current_dir(dir);
        }
        cmd
    }
}

/// `--image-file` for the first input, `--image-file-N` for the rest.
pub fn image_file_flag(index: usize) -> String {
    match index {
        0 => "--image-file".to_string(),
        n => format!("--image-file-{}", n + 1),
    }
}

/// Multipart field carrying the input at `index` in `/infer` uploads:
/// `image_file`, then `image_file_2` to `image_file_4`.
pub fn image_field_name(index: usize) -> String {
    match index {
        0 => "image_file".to_string(),
        n => format!("image_file_{}", n + 1),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    fn argv(cmd: &InferenceCommand) -> Vec<String> {
        cmd.args
            .iter()
            .map(|a| a.to_string_lossy().into_owned())
            .collect()
    }

    #[test]
    fn test_single_input_command() {
        let cmd = InferenceCommand::segmentation(
            "python3",
            Path::new("/opt/scripts/infer.py"),
            Path::new("/models/m/model.pt"),
            &[PathBuf::from("/tmp/job/input-volume.nrrd")],
            Path::new("/tmp/job/output-segmentation.nii.gz"),
        )
        .unwrap();

        assert_eq!(cmd.program, OsString::from("python3"));
        assert_eq!(
            argv(&cmd),
            vec![
                "/opt/scripts/infer.py",
                "--model-file",
                "/models/m/model.pt",
                "--image-file",
                "/tmp/job/input-volume.nrrd",
                "--result-file",
                "/tmp/job/output-segmentation.nii.gz",
            ]
        );
    }

    #[test]
    fn test_multi_input_flags() {
        let inputs: Vec<PathBuf> = (1..=4).map(|i| PathBuf::from(format!("in{i}.nrrd"))).collect();
        let cmd = InferenceCommand::segmentation(
            "python3",
            Path::new("infer.py"),
            Path::new("model.pt"),
            &inputs,
            Path::new("out.nii.gz"),
        )
        .unwrap();
        let args = argv(&cmd);
        for flag in ["--image-file", "--image-file-2", "--image-file-3", "--image-file-4"] {
            assert!(args.iter().any(|a| a == flag), "missing {flag}");
        }
    }

    #[test]
    fn test_input_count_bounds() {
        let none: Vec<PathBuf> = Vec::new();
        let five: Vec<PathBuf> = (0..5).map(|i| PathBuf::from(format!("{i}.nrrd"))).collect();
        for inputs in [none, five] {
            let err = InferenceCommand::segmentation(
                "python3",
                Path::new("infer.py"),
                Path::new("model.pt"),
                &inputs,
                Path::new("out.nii.gz"),
            )
            .unwrap_err();
            assert!(matches!(err, ProcessError::InvalidInputCount { .. }));
        }
    }

    #[test]
    fn test_force_cpu_sets_gpu_visibility() {
        let cmd = InferenceCommand::new("python3").force_cpu();
        assert_eq!(
            cmd.env.get(OsStr::new(GPU_VISIBILITY_VAR)),
            Some(&OsString::from("-1"))
        );
    }

    #[test]
    fn test_upload_field_names() {
        let names: Vec<String> = (0..MAX_INPUT_IMAGES).map(image_field_name).collect();
        assert_eq!(names, vec!["image_file", "image_file_2", "image_file_3", "image_file_4"]);
    }

    #[test]
    fn test_display_joins_argv() {
        let cmd = InferenceCommand::new("sh").args(["-c", "echo hi"]);
        assert_eq!(cmd.display(), "sh -c echo hi");
        assert_eq!(cmd.program_name(), "sh");
    }
}
