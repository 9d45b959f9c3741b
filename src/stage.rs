/// The pipelined stage schedule.
///
/// A decode step is one traversal of the stage list. Each stage assigns every
/// platform a role (which compute block it runs) and a sub-batch binding
/// (which slice of the active requests it runs it on). Both tables are fixed
/// per scheduling mode; the scheduler only ever walks them forward.
///
/// 2-way interleaving (`#k` = sub-batch k):
///
/// |     |   A    |   B    |      C       |      D       |    E    |    F    |
/// |-----|--------|--------|--------------|--------------|---------|---------|
/// | SA  | QKV#1  | QKV#2  | Pj+FFN+QKV#1 | Pj+FFN+QKV#2 | Pj+FFN#1| Pj+FFN#2|
/// | PIM |   -    | MHA#1  |    MHA#2     |    MHA#1     |  MHA#2  |    -    |
///
/// 3-way interleaving splits MHA into logit-softmax and attend, and FFN into
/// FFN1/FFN2; stages A-E fill the pipe, F-K loop, L-P drain (see the role
/// tables below).
use serde::{Deserialize, Serialize};

use crate::error::SimError;

/// Sub-batch interleaving mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum SubBatchMode {
    TwoWay,
    ThreeWay,
}

impl SubBatchMode {
    /// Number of sub-batches the active set is partitioned into.
    pub fn sub_batches(&self) -> usize {
        match self {
            SubBatchMode::TwoWay => 2,
            SubBatchMode::ThreeWay => 3,
        }
    }

    /// Platform slots in program order (slot index = queue index).
    pub fn platforms(&self) -> &'static [StagePlatform] {
        match self {
            SubBatchMode::TwoWay => &[StagePlatform::Sa, StagePlatform::Pim],
            SubBatchMode::ThreeWay => {
                &[StagePlatform::Sa1, StagePlatform::Pim, StagePlatform::Sa2]
            }
        }
    }
}

/// Compute platform a stage program is built for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum StagePlatform {
    Sa,
    Sa1,
    Sa2,
    Pim,
}

impl std::fmt::Display for StagePlatform {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StagePlatform::Sa => write!(f, "SA"),
            StagePlatform::Sa1 => write!(f, "SA1"),
            StagePlatform::Sa2 => write!(f, "SA2"),
            StagePlatform::Pim => write!(f, "PIM"),
        }
    }
}

/// One entry of the pipelined schedule. The full list serves ThreeWay;
/// TwoWay uses A-F and wraps from F.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum Stage {
    A,
    B,
    C,
    D,
    E,
    F,
    G,
    H,
    I,
    J,
    K,
    L,
    M,
    N,
    O,
    P,
    Finish,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}", self)
    }
}

impl Stage {
    pub fn index(&self) -> usize {
        *self as usize
    }

    /// Successor under the given mode; the last scheduled stage wraps to
    /// `Finish`.
    pub fn next(&self, mode: SubBatchMode) -> Stage {
        use Stage::*;
        match (mode, *self) {
            (SubBatchMode::TwoWay, F) => Finish,
            (SubBatchMode::ThreeWay, P) => Finish,
            (_, Finish) => Finish,
            (_, s) => ALL[s.index() + 1],
        }
    }
}

const ALL: [Stage; 17] = [
    Stage::A,
    Stage::B,
    Stage::C,
    Stage::D,
    Stage::E,
    Stage::F,
    Stage::G,
    Stage::H,
    Stage::I,
    Stage::J,
    Stage::K,
    Stage::L,
    Stage::M,
    Stage::N,
    Stage::O,
    Stage::P,
    Stage::Finish,
];

/// The compute block a platform runs in a given stage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    /// LayerNorm -> MatMul(QKVGen)
    QkvGen,
    /// MatMul(Proj) -> Add(residual)
    Proj,
    /// LayerNorm -> MatMul(FC1) -> Gelu
    Ffn1,
    /// MatMul(FC2) -> Add(residual)
    Ffn2,
    /// Projection + fused FFN + QKV-gen (TwoWay loop stages)
    FullSa,
    /// Projection + fused FFN (TwoWay drain stages)
    PjFfn,
    /// LogitSoftmax -> Attend in one program (TwoWay PIM)
    Mha,
    /// Q x K^T plus softmax against the cached keys
    LogitSoftmax,
    /// Softmax output against the cached values
    Attend,
}

/// Role of `platform` in `stage`, or `None` when the platform sits the stage
/// out (its program is empty and finishes immediately).
pub fn role(mode: SubBatchMode, stage: Stage, platform: StagePlatform) -> Option<Role> {
    use Stage::*;
    match mode {
        SubBatchMode::TwoWay => match platform {
            StagePlatform::Sa => match stage {
                A | B => Some(Role::QkvGen),
                C | D => Some(Role::FullSa),
                E | F => Some(Role::PjFfn),
                _ => None,
            },
            StagePlatform::Pim => match stage {
                B | C | D | E => Some(Role::Mha),
                _ => None,
            },
            _ => None,
        },
        SubBatchMode::ThreeWay => match platform {
            StagePlatform::Sa1 => match stage {
                A | B | C | G | I | K => Some(Role::QkvGen),
                D | F | H | J | L | N => Some(Role::Proj),
                _ => None,
            },
            StagePlatform::Sa2 => match stage {
                E | G | I | K | M | O => Some(Role::Ffn1),
                F | H | J | L | N | P => Some(Role::Ffn2),
                _ => None,
            },
            StagePlatform::Pim => match stage {
                B | D | F | H | J | L => Some(Role::LogitSoftmax),
                C | E | G | I | K | M => Some(Role::Attend),
                _ => None,
            },
            _ => None,
        },
    }
}

/// Sub-batch index (0-based) bound to each platform slot for `stage`, in
/// `mode.platforms()` order. TwoWay alternates by stage parity; ThreeWay is
/// a fixed rotation table. Stage A deliberately hands SA1 sub-batch 2 while
/// 1 and 3 idle on the SA side; the schedule is asymmetric there.
pub fn binding(mode: SubBatchMode, stage: Stage) -> Vec<usize> {
    use Stage::*;
    match mode {
        SubBatchMode::TwoWay => {
            // [SA, PIM]
            if stage.index() % 2 == 0 {
                vec![0, 1]
            } else {
                vec![1, 0]
            }
        }
        SubBatchMode::ThreeWay => {
            // (SA1, SA2, PIM), 1-based as in the schedule tables.
            let (sa1, sa2, pim) = match stage {
                A => (2, 1, 3),
                B => (2, 3, 1),
                C => (3, 2, 1),
                D => (1, 3, 2),
                E => (3, 1, 2),
                F => (1, 2, 3),
                G => (2, 1, 3),
                H => (2, 3, 1),
                I => (3, 2, 1),
                J => (3, 1, 2),
                K => (1, 3, 2),
                L => (2, 1, 3),
                M => (1, 2, 3),
                N => (3, 2, 1),
                O => (1, 3, 2),
                P => (1, 3, 2),
                Finish => panic!(
                    "{}",
                    SimError::InvalidStage {
                        platform: "all".into(),
                        stage: stage.to_string(),
                    }
                ),
            };
            // Slot order is [SA1, PIM, SA2].
            vec![sa1 - 1, pim - 1, sa2 - 1]
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn two_way_wraps_at_f() {
        assert_eq!(Stage::F.next(SubBatchMode::TwoWay), Stage::Finish);
        assert_eq!(Stage::A.next(SubBatchMode::TwoWay), Stage::B);
    }

    #[test]
    fn three_way_wraps_at_p() {
        assert_eq!(Stage::P.next(SubBatchMode::ThreeWay), Stage::Finish);
        assert_eq!(Stage::K.next(SubBatchMode::ThreeWay), Stage::L);
    }

    #[test]
    fn two_way_parity_binding() {
        // Even stages: SA gets sub-batch 1, PIM sub-batch 2.
        assert_eq!(binding(SubBatchMode::TwoWay, Stage::A), vec![0, 1]);
        assert_eq!(binding(SubBatchMode::TwoWay, Stage::C), vec![0, 1]);
        assert_eq!(binding(SubBatchMode::TwoWay, Stage::B), vec![1, 0]);
        assert_eq!(binding(SubBatchMode::TwoWay, Stage::F), vec![1, 0]);
    }

    #[test]
    fn three_way_stage_a_exception() {
        // SA1 is bound to sub-batch 2 in stage A even though only QKV#1
        // appears in the role table; the asymmetry is part of the schedule.
        let b = binding(SubBatchMode::ThreeWay, Stage::A);
        assert_eq!(b, vec![1, 2, 0]); // SA1=2, PIM=3, SA2=1 (1-based)
    }

    #[test]
    fn three_way_loop_bindings_are_permutations() {
        for stage in [
            Stage::A,
            Stage::B,
            Stage::C,
            Stage::D,
            Stage::E,
            Stage::F,
            Stage::G,
            Stage::H,
            Stage::I,
            Stage::J,
            Stage::K,
            Stage::L,
            Stage::M,
            Stage::N,
            Stage::O,
            Stage::P,
        ] {
            let mut b = binding(SubBatchMode::ThreeWay, stage);
            b.sort();
            assert_eq!(b, vec![0, 1, 2], "stage {stage}");
        }
    }

    #[test]
    fn three_way_roles_match_schedule() {
        use StagePlatform::*;
        assert_eq!(role(SubBatchMode::ThreeWay, Stage::A, Sa1), Some(Role::QkvGen));
        assert_eq!(role(SubBatchMode::ThreeWay, Stage::A, Pim), None);
        assert_eq!(role(SubBatchMode::ThreeWay, Stage::E, Sa2), Some(Role::Ffn1));
        assert_eq!(role(SubBatchMode::ThreeWay, Stage::E, Pim), Some(Role::Attend));
        assert_eq!(
            role(SubBatchMode::ThreeWay, Stage::L, Pim),
            Some(Role::LogitSoftmax)
        );
        assert_eq!(role(SubBatchMode::ThreeWay, Stage::P, Sa1), None);
        assert_eq!(role(SubBatchMode::ThreeWay, Stage::P, Sa2), Some(Role::Ffn2));
    }

    #[test]
    fn two_way_pim_sits_out_first_and_last() {
        assert_eq!(role(SubBatchMode::TwoWay, Stage::A, StagePlatform::Pim), None);
        assert_eq!(role(SubBatchMode::TwoWay, Stage::F, StagePlatform::Pim), None);
        assert_eq!(
            role(SubBatchMode::TwoWay, Stage::D, StagePlatform::Pim),
            Some(Role::Mha)
        );
    }
}
