use std::io;
use std::path::{Path, PathBuf};
use windtunnel::*;

/// Bytes that are not valid UTF-8, copied verbatim by the assembler.
pub const BINARY_ASSET: &[u8] = &[0x1f, 0x8b, 0x08, 0x00, 0xff, 0xfe, 0x00, 0x01];

/// A cube standing in for a vehicle body.
pub const VEHICLE_OBJ: &str = "\
o vehicle
v 0.0 0.0 0.0
v 1.0 0.0 0.0
v 1.0 1.0 0.0
v 0.0 1.0 0.0
v 0.0 0.0 1.0
v 1.0 0.0 1.0
v 1.0 1.0 1.0
v 0.0 1.0 1.0
f 1 2 3 4
f 5 6 7 8
f 1 2 6 5
f 2 3 7 6
f 3 4 8 7
f 4 1 5 8
";

const TEMPLATE_FILES: &[(&str, &str)] = &[
    (
        "system/controlDict",
        "application simpleFoam;\nendTime {{ num_iterations }};\nwriteInterval {{num_iterations}};\n",
    ),
    (
        "system/blockMeshDict",
        "vertices\n(\n    ({{ x_min }} {{ y_min }} {{ z_min }})\n    ({{ x_max }} {{ y_max }} {{ z_max }})\n);\n",
    ),
    (
        "system/snappyHexMeshDict",
        "refinementSurfaces\n{\n    object { level ({{ resolution }} {{ resolution }}); }\n}\n",
    ),
    (
        "0/U",
        "internalField uniform {{ flow_velocity }};\ninlet { type fixedValue; value uniform {{ flow_velocity }}; }\n",
    ),
    (
        "0/include/initialConditions",
        "flowVelocity ({{ flow_velocity[0] }} {{ flow_velocity[1] }} {{ flow_velocity[2] }});\n",
    ),
    (
        "constant/transportProperties",
        "transportModel Newtonian;\nnu 1.5e-05;\n",
    ),
];

/// Write a small OpenFOAM case skeleton under `dir` that uses every
/// wind tunnel and simulation parameter.
pub fn write_template_tree(dir: &Path) -> io::Result<()> {
    for (relative, contents) in TEMPLATE_FILES {
        write(&dir.join(relative), contents.as_bytes())?;
    }
    write(&dir.join("constant/geometry.gz"), BINARY_ASSET)
}

/// Write [`VEHICLE_OBJ`] to `path`.
pub fn write_mesh(path: &Path) -> io::Result<PathBuf> {
    write(path, VEHICLE_OBJ.as_bytes())?;
    Ok(path.to_path_buf())
}

fn write(path: &Path, contents: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        std::fs::create_dir_all(parent)?;
    }
    std::fs::write(path, contents)
}

/// The reference tunnel: 30 m/s along x inside `x:[-5,15] y:[-5,5] z:[0,8]`.
pub fn example_wind_tunnel() -> WindTunnel {
    WindTunnel::new(
        [30.0, 0.0, 0.0],
        Some(DomainSpec::axes([
            ("x", [-5.0, 15.0]),
            ("y", [-5.0, 5.0]),
            ("z", [0.0, 8.0]),
        ])),
    )
    .expect("example wind tunnel is valid")
}

pub fn example_parameters() -> SimulationParameters {
    SimulationParameters::new(50, 2).expect("example parameters are valid")
}

/// Template skeleton, object mesh and working directory in one temp dir.
pub struct Workspace {
    dir: tempfile::TempDir,
}

impl Workspace {
    pub fn new() -> io::Result<Self> {
        let dir = tempfile::tempdir()?;
        write_template_tree(&dir.path().join("template"))?;
        write_mesh(&dir.path().join("assets/vehicle.obj"))?;
        std::fs::create_dir_all(dir.path().join("runs"))?;
        Ok(Self { dir })
    }

    pub fn root(&self) -> &Path {
        self.dir.path()
    }

    pub fn template(&self) -> PathBuf {
        self.root().join("template")
    }

    pub fn mesh(&self) -> PathBuf {
        self.root().join("assets/vehicle.obj")
    }

    pub fn working_dir(&self) -> PathBuf {
        self.root().join("runs")
    }

    pub fn job_log(&self) -> PathBuf {
        self.root().join("runs/tasks.jsonl")
    }

    pub fn config(&self) -> WindTunnelConfig {
        WindTunnelConfig::new(self.working_dir()).with_job_log(self.job_log())
    }
}
