use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::IllegalStateError;

/// One solver stage a worker runs against an assembled case.
///
/// Declaration order is execution order.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SolverStage {
    /// Derive geometric feature lines from the object mesh.
    ExtractFeatures,
    /// Build the coarse background mesh from the domain box.
    GenerateBlockMesh,
    /// Partition the case across the allocated cores.
    DecomposeDomain,
    /// Refine around the object, overwriting the coarse mesh.
    ParallelMeshRefine,
    /// Inviscid potential-flow initial guess.
    InitialPotentialSolve,
    /// Incompressible steady-state iterations; the dominant cost.
    SteadyStateSolve,
    ReconstructMesh,
    ReconstructFields,
}

impl SolverStage {
    pub const ALL: [SolverStage; 8] = [
        SolverStage::ExtractFeatures,
        SolverStage::GenerateBlockMesh,
        SolverStage::DecomposeDomain,
        SolverStage::ParallelMeshRefine,
        SolverStage::InitialPotentialSolve,
        SolverStage::SteadyStateSolve,
        SolverStage::ReconstructMesh,
        SolverStage::ReconstructFields,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SolverStage::ExtractFeatures => "extract_features",
            SolverStage::GenerateBlockMesh => "generate_block_mesh",
            SolverStage::DecomposeDomain => "decompose_domain",
            SolverStage::ParallelMeshRefine => "parallel_mesh_refine",
            SolverStage::InitialPotentialSolve => "initial_potential_solve",
            SolverStage::SteadyStateSolve => "steady_state_solve",
            SolverStage::ReconstructMesh => "reconstruct_mesh",
            SolverStage::ReconstructFields => "reconstruct_fields",
        }
    }

    /// Shell-level command the worker executes.
    pub fn command(&self) -> &'static str {
        match self {
            SolverStage::ExtractFeatures => "runApplication surfaceFeatures",
            SolverStage::GenerateBlockMesh => "runApplication blockMesh",
            SolverStage::DecomposeDomain => "runApplication decomposePar -copyZero",
            SolverStage::ParallelMeshRefine => "runParallel snappyHexMesh -overwrite",
            SolverStage::InitialPotentialSolve => "runParallel potentialFoam",
            SolverStage::SteadyStateSolve => "runParallel simpleFoam",
            SolverStage::ReconstructMesh => "runApplication reconstructParMesh -constant",
            SolverStage::ReconstructFields => "runApplication reconstructPar -latestTime",
        }
    }

    pub fn is_parallel(&self) -> bool {
        matches!(
            self,
            SolverStage::ParallelMeshRefine
                | SolverStage::InitialPotentialSolve
                | SolverStage::SteadyStateSolve
        )
    }

    pub fn next(&self) -> Option<SolverStage> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

impl fmt::Display for SolverStage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// The fixed, ordered list of stages submitted with every case.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CommandPipeline {
    stages: Vec<SolverStage>,
}

impl CommandPipeline {
    pub fn steady_state() -> Self {
        Self {
            stages: SolverStage::ALL.to_vec(),
        }
    }

    pub fn stages(&self) -> &[SolverStage] {
        &self.stages
    }

    pub fn commands(&self) -> Vec<String> {
        self.stages.iter().map(|s| s.command().to_string()).collect()
    }

    pub fn len(&self) -> usize {
        self.stages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.stages.is_empty()
    }

    pub fn start(&self) -> PipelineProgress {
        match self.stages.first() {
            Some(stage) => PipelineProgress::Pending(*stage),
            None => PipelineProgress::Complete,
        }
    }
}

impl Default for CommandPipeline {
    fn default() -> Self {
        Self::steady_state()
    }
}

/// Where a run of the pipeline currently stands.
///
/// Each stage only runs after the previous one succeeded; the first failure
/// is terminal.
#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize, Deserialize)]
#[serde(tag = "state", content = "stage", rename_all = "snake_case")]
pub enum PipelineProgress {
    Pending(SolverStage),
    Complete,
    Failed(SolverStage),
}

impl PipelineProgress {
    pub fn is_terminal(&self) -> bool {
        !matches!(self, PipelineProgress::Pending(_))
    }

    pub fn current(&self) -> Option<SolverStage> {
        match self {
            PipelineProgress::Pending(stage) => Some(*stage),
            _ => None,
        }
    }

    /// Records the outcome of the current stage.
    pub fn advance(self, succeeded: bool) -> Result<PipelineProgress, IllegalStateError> {
        match self {
            PipelineProgress::Pending(stage) if succeeded => Ok(stage
                .next()
                .map_or(PipelineProgress::Complete, PipelineProgress::Pending)),
            PipelineProgress::Pending(stage) => Ok(PipelineProgress::Failed(stage)),
            terminal => Err(IllegalStateError::new("advance pipeline", terminal)),
        }
    }
}

impl fmt::Display for PipelineProgress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            PipelineProgress::Pending(stage) => write!(f, "pending {stage}"),
            PipelineProgress::Complete => f.write_str("complete"),
            PipelineProgress::Failed(stage) => write!(f, "failed at {stage}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_steady_state_pipeline_is_fixed() {
        let pipeline = CommandPipeline::steady_state();
        assert_eq!(pipeline.len(), 8);
        assert_eq!(
            pipeline.stages().iter().map(SolverStage::as_str).collect::<Vec<_>>(),
            vec![
                "extract_features",
                "generate_block_mesh",
                "decompose_domain",
                "parallel_mesh_refine",
                "initial_potential_solve",
                "steady_state_solve",
                "reconstruct_mesh",
                "reconstruct_fields",
            ]
        );
        assert_eq!(pipeline, CommandPipeline::default());
    }

    #[test]
    fn test_commands_match_stages() {
        let commands = CommandPipeline::steady_state().commands();
        assert_eq!(commands[0], "runApplication surfaceFeatures");
        assert_eq!(commands[3], "runParallel snappyHexMesh -overwrite");
        assert_eq!(commands[5], "runParallel simpleFoam");
        assert_eq!(commands[7], "runApplication reconstructPar -latestTime");
    }

    #[test]
    fn test_parallel_stages() {
        let parallel: Vec<_> = SolverStage::ALL.iter().filter(|s| s.is_parallel()).collect();
        assert_eq!(parallel.len(), 3);
        assert!(parallel.iter().all(|s| s.command().starts_with("runParallel")));
    }

    #[test]
    fn test_progress_runs_to_completion() {
        let mut progress = CommandPipeline::steady_state().start();
        let mut visited = Vec::new();
        while let Some(stage) = progress.current() {
            visited.push(stage);
            progress = progress.advance(true).unwrap();
        }
        assert_eq!(progress, PipelineProgress::Complete);
        assert_eq!(visited, SolverStage::ALL.to_vec());
    }

    #[test]
    fn test_failure_is_terminal() {
        let progress = PipelineProgress::Pending(SolverStage::DecomposeDomain)
            .advance(false)
            .unwrap();
        assert_eq!(progress, PipelineProgress::Failed(SolverStage::DecomposeDomain));
        assert!(progress.is_terminal());
        assert!(progress.advance(true).is_err());
        assert!(PipelineProgress::Complete.advance(true).is_err());
    }
}
