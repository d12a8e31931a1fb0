//! # Abstração de Ponto Flutuante
//!
//! Todo o motor é escrito uma única vez, genérico sobre `T: Real`, e instanciado
//! em precisão simples (`f32`) e dupla (`f64`) com a mesma semântica.
//!
//! ## Acumulação
//!
//! Somas de redução (normalização de mensagens e crenças, entropia, energia,
//! log-verossimilhança) acumulam sempre em `f64`, a largura mais larga suportada,
//! para limitar o erro de arredondamento acumulado quando `T = f32`.

use std::fmt::Debug;
use std::ops::{AddAssign, DivAssign, MulAssign};

use ndarray::{LinalgScalar, ScalarOperand};
use num_traits::Float;

/// Tipo escalar aceito pelo motor (`f32` ou `f64`).
pub trait Real:
    Float
    + LinalgScalar
    + ScalarOperand
    + AddAssign
    + MulAssign
    + DivAssign
    + Default
    + Debug
    + Send
    + Sync
{
    /// Converte um valor do acumulador (`f64`) para `T`.
    fn from_acc(value: f64) -> Self;

    /// Promove `self` para o acumulador (`f64`).
    fn to_acc(self) -> f64;
}

impl Real for f32 {
    #[inline]
    fn from_acc(value: f64) -> Self {
        value as f32
    }

    #[inline]
    fn to_acc(self) -> f64 {
        self as f64
    }
}

impl Real for f64 {
    #[inline]
    fn from_acc(value: f64) -> Self {
        value
    }

    #[inline]
    fn to_acc(self) -> f64 {
        self
    }
}
