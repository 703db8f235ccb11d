//! Case template assembly.
//!
//! A template skeleton is a directory tree whose text files may contain
//! `{{ name }}` placeholders (or `{{ name[i] }}` for one component of a
//! vector). [`CaseAssembler::assemble`] copies the skeleton into a
//! destination directory, substitutes every placeholder from a [`ParamMap`],
//! and drops the object mesh at [`OBJECT_MESH_PATH`].
//!
//! Re-running against the same destination requires
//! [`AssemblyOptions::overwrite`]; the old tree is then removed and rebuilt
//! from scratch, so identical inputs always produce a byte-identical tree.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::TemplateResolutionError;
use crate::model::{ParamMap, ParamValue};

/// Location of the object mesh inside an assembled case.
pub const OBJECT_MESH_PATH: &str = "constant/triSurface/object.obj";

#[derive(Clone, Copy, Debug, Default)]
pub struct AssemblyOptions {
    /// Replace an existing non-empty destination instead of failing.
    pub overwrite: bool,
}

impl AssemblyOptions {
    pub fn overwrite() -> Self {
        Self { overwrite: true }
    }
}

/// A solver-ready input directory.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Case {
    root: PathBuf,
    files: Vec<PathBuf>,
}

impl Case {
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Files written during assembly, relative to [`Case::root`], in
    /// traversal order.
    pub fn files(&self) -> &[PathBuf] {
        &self.files
    }

    pub fn object_mesh(&self) -> PathBuf {
        self.root.join(OBJECT_MESH_PATH)
    }
}

/// Builds cases from one template skeleton.
#[derive(Clone, Debug)]
pub struct CaseAssembler {
    template_root: PathBuf,
}

impl CaseAssembler {
    pub fn new(template_root: impl Into<PathBuf>) -> Self {
        Self {
            template_root: template_root.into(),
        }
    }

    pub fn template_root(&self) -> &Path {
        &self.template_root
    }

    pub fn assemble(
        &self,
        object_path: &Path,
        params: &ParamMap,
        destination: &Path,
        options: AssemblyOptions,
    ) -> Result<Case, TemplateResolutionError> {
        if !self.template_root.is_dir() {
            return Err(TemplateResolutionError::MissingTemplateRoot(
                self.template_root.clone(),
            ));
        }
        if is_within(destination, &self.template_root) {
            return Err(TemplateResolutionError::DestinationInsideTemplate {
                destination: destination.to_path_buf(),
                template_root: self.template_root.clone(),
            });
        }
        let mesh = fs::read(object_path).map_err(|source| {
            TemplateResolutionError::UnreadableObject {
                path: object_path.to_path_buf(),
                source,
            }
        })?;

        prepare_destination(destination, options)?;

        let mut files = Vec::new();
        let built = copy_tree(&self.template_root, destination, Path::new(""), params, &mut files)
            .and_then(|()| {
                let target = destination.join(OBJECT_MESH_PATH);
                write_file(&target, &mesh)?;
                files.push(PathBuf::from(OBJECT_MESH_PATH));
                Ok(())
            });

        if let Err(err) = built {
            if let Err(cleanup) = fs::remove_dir_all(destination) {
                tracing::warn!(
                    path = %destination.display(),
                    error = %cleanup,
                    "failed to remove partially assembled case"
                );
            }
            return Err(err);
        }

        tracing::info!(
            case_root = %destination.display(),
            template = %self.template_root.display(),
            files = files.len(),
            "case assembled"
        );

        Ok(Case {
            root: destination.to_path_buf(),
            files,
        })
    }
}

/// Compares absolute forms, resolving symlinks where the path exists.
fn is_within(path: &Path, root: &Path) -> bool {
    let normalize = |p: &Path| {
        fs::canonicalize(p)
            .or_else(|_| std::path::absolute(p))
            .unwrap_or_else(|_| p.to_path_buf())
    };
    let root = normalize(root);
    let mut current = Some(path);
    while let Some(candidate) = current {
        if candidate.exists() {
            let resolved = normalize(candidate);
            let rest = path.strip_prefix(candidate).unwrap_or(Path::new(""));
            return resolved.join(rest).starts_with(&root);
        }
        current = candidate.parent().filter(|p| !p.as_os_str().is_empty());
    }
    normalize(path).starts_with(&root)
}

fn prepare_destination(
    destination: &Path,
    options: AssemblyOptions,
) -> Result<(), TemplateResolutionError> {
    if destination.is_dir() {
        let occupied = fs::read_dir(destination)
            .map_err(io_at(destination))?
            .next()
            .is_some();
        if occupied {
            if !options.overwrite {
                return Err(TemplateResolutionError::DestinationExists(
                    destination.to_path_buf(),
                ));
            }
            tracing::debug!(path = %destination.display(), "replacing existing case");
            fs::remove_dir_all(destination).map_err(io_at(destination))?;
        }
    } else if destination.exists() {
        if !options.overwrite {
            return Err(TemplateResolutionError::DestinationExists(
                destination.to_path_buf(),
            ));
        }
        fs::remove_file(destination).map_err(io_at(destination))?;
    }

    fs::create_dir_all(destination).map_err(io_at(destination))
}

fn copy_tree(
    source_root: &Path,
    destination_root: &Path,
    relative: &Path,
    params: &ParamMap,
    files: &mut Vec<PathBuf>,
) -> Result<(), TemplateResolutionError> {
    let dir = source_root.join(relative);
    let mut entries = fs::read_dir(&dir)
        .map_err(io_at(&dir))?
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_at(&dir))?;
    entries.sort_by_key(|entry| entry.file_name());

    fs::create_dir_all(destination_root.join(relative)).map_err(io_at(destination_root))?;

    for entry in entries {
        let child = relative.join(entry.file_name());
        let source = source_root.join(&child);
        if source.is_dir() {
            copy_tree(source_root, destination_root, &child, params, files)?;
            continue;
        }

        let bytes = fs::read(&source).map_err(io_at(&source))?;
        let output = match String::from_utf8(bytes) {
            Ok(text) => render(&text, params, &child)?.into_bytes(),
            Err(binary) => binary.into_bytes(),
        };
        write_file(&destination_root.join(&child), &output)?;
        files.push(child);
    }
    Ok(())
}

fn write_file(path: &Path, contents: &[u8]) -> Result<(), TemplateResolutionError> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).map_err(io_at(parent))?;
    }
    fs::write(path, contents).map_err(io_at(path))
}

fn io_at(path: &Path) -> impl FnOnce(std::io::Error) -> TemplateResolutionError {
    let path = path.to_path_buf();
    move |source| TemplateResolutionError::Io { path, source }
}

/// Substitutes every placeholder in `template`. `file` is only used in
/// error reports.
pub fn render(
    template: &str,
    params: &ParamMap,
    file: &Path,
) -> Result<String, TemplateResolutionError> {
    let mut out = String::with_capacity(template.len());
    let mut rest = template;

    while let Some(start) = rest.find("{{") {
        out.push_str(&rest[..start]);
        let after = &rest[start + 2..];
        let end = after
            .find("}}")
            .ok_or_else(|| malformed(file, "unterminated `{{`".to_string()))?;
        out.push_str(&resolve(after[..end].trim(), params, file)?);
        rest = &after[end + 2..];
    }
    out.push_str(rest);
    Ok(out)
}

fn resolve(expr: &str, params: &ParamMap, file: &Path) -> Result<String, TemplateResolutionError> {
    let (name, index) = match expr.split_once('[') {
        Some((name, tail)) => {
            let digits = tail
                .strip_suffix(']')
                .ok_or_else(|| malformed(file, format!("`{expr}` is missing `]`")))?;
            let index = digits
                .trim()
                .parse::<usize>()
                .map_err(|_| malformed(file, format!("`{expr}` has a non-numeric index")))?;
            (name.trim(), Some(index))
        }
        None => (expr, None),
    };

    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_') {
        return Err(malformed(file, format!("`{expr}` is not a valid placeholder name")));
    }

    let value = params
        .get(name)
        .ok_or_else(|| TemplateResolutionError::Unresolved {
            name: name.to_string(),
            file: file.to_path_buf(),
        })?;

    match (index, value) {
        (None, value) => Ok(value.to_string()),
        (Some(i), ParamValue::Vector(_)) => value
            .component(i)
            .map(|c| c.to_string())
            .ok_or_else(|| malformed(file, format!("`{expr}` index out of range"))),
        (Some(_), _) => Err(malformed(file, format!("`{name}` is not a vector"))),
    }
}

fn malformed(file: &Path, detail: String) -> TemplateResolutionError {
    TemplateResolutionError::Malformed {
        file: file.to_path_buf(),
        detail,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{SimulationParameters, WindTunnel};

    fn params() -> ParamMap {
        WindTunnel::default()
            .to_params()
            .merged_with(&SimulationParameters::default().to_params())
    }

    #[test]
    fn test_render_scalars_and_vectors() {
        let out = render(
            "endTime {{num_iterations}};\nUinlet {{ flow_velocity }};\nUx {{ flow_velocity[0] }};",
            &params(),
            Path::new("system/controlDict"),
        )
        .unwrap();
        assert_eq!(out, "endTime 100;\nUinlet (30 0 0);\nUx 30;");
    }

    #[test]
    fn test_render_leaves_single_braces_alone() {
        let text = "boundaryField\n{\n    inlet { type fixedValue; }\n}\n";
        assert_eq!(render(text, &params(), Path::new("0/U")).unwrap(), text);
    }

    #[test]
    fn test_destination_inside_template_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let template = dir.path().join("template");
        fs::create_dir_all(template.join("system")).unwrap();
        fs::write(template.join("system/controlDict"), "endTime {{ num_iterations }};\n").unwrap();
        let mesh = dir.path().join("object.obj");
        fs::write(&mesh, "v 0 0 0\n").unwrap();

        let assembler = CaseAssembler::new(&template);
        let destination = template.join("runs/case-1");
        let err = assembler
            .assemble(&mesh, &params(), &destination, AssemblyOptions::default())
            .unwrap_err();
        assert!(matches!(
            err,
            TemplateResolutionError::DestinationInsideTemplate { .. }
        ));
        assert!(!template.join("runs").exists());

        let sibling = dir.path().join("template-runs/case-1");
        assert!(assembler
            .assemble(&mesh, &params(), &sibling, AssemblyOptions::default())
            .is_ok());
    }

    #[test]
    fn test_unresolved_placeholder() {
        let err = render("{{ turbulence_model }}", &params(), Path::new("constant/x")).unwrap_err();
        match err {
            TemplateResolutionError::Unresolved { name, file } => {
                assert_eq!(name, "turbulence_model");
                assert_eq!(file, PathBuf::from("constant/x"));
            }
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn test_malformed_placeholders() {
        for bad in [
            "{{ resolution",
            "{{ }}",
            "{{ flow velocity }}",
            "{{ flow_velocity[3] }}",
            "{{ flow_velocity[a] }}",
            "{{ flow_velocity[0 }}",
            "{{ resolution[0] }}",
        ] {
            let err = render(bad, &params(), Path::new("f")).unwrap_err();
            assert!(
                matches!(err, TemplateResolutionError::Malformed { .. }),
                "{bad} gave {err:?}"
            );
        }
    }
}
