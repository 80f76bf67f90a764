//! Canonical layout changes for matrix and convolution operands.
//!
//! A remapper turns the footprint of an operand in its original layout into
//! the footprint of the buffer the matrix unit expects, and gives the map
//! from buffer coordinates back to the original tensor so copy statements
//! can be generated.

use crate::footprint::FootprintBox;
use crate::{FootprintError, FootprintResult};
use tpo_poly::{Aff, IndexExpr, PolyError, PolyResult, VarRange};
use tpo_session::ConvAttrs;

/// Block size of the fractal layout along the output-position dimension.
pub const FRACTAL_BLOCK: i64 = 16;

/// A canonical reshaping of one operand.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Remapper {
    /// `(…, no, ko, ki, ni) → (…, ko, no, ni, ki)`.
    GemmTranspose {
        /// Operand the remapping applies to.
        matrix: String,
    },
    /// `(…, no, ko, ki, ni) → (…, ko, no, ki, ni)`.
    GemmTransposeBlock {
        /// Operand the remapping applies to.
        matrix: String,
    },
    /// `(…, no, ko, ki, ni) → (…, no, ko, ni, ki)`.
    GemmInnerTranspose {
        /// Operand the remapping applies to.
        matrix: String,
    },
    /// `(N, C1, H, W, C0) → (N, ho·wo, C1, kh, kw, C0)`.
    Im2col(ConvAttrs),
    /// `(Kh, Kw, Cin, Cout) → (Kh reversed, Kw reversed, Cout, Cin)`.
    Weight(ConvAttrs),
    /// im2col followed by blocking the output positions by [`FRACTAL_BLOCK`].
    Fractal(ConvAttrs),
}

/// Output-plane size of an im2col tile.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct Im2colGeometry {
    /// Output rows per tile.
    pub ho: i64,
    /// Output columns per tile.
    pub wo: i64,
}

impl Remapper {
    /// Short name for logs.
    #[must_use]
    pub const fn name(&self) -> &'static str {
        match self {
            Self::GemmTranspose { .. } => "gemm_transpose",
            Self::GemmTransposeBlock { .. } => "gemm_transpose_block",
            Self::GemmInnerTranspose { .. } => "gemm_inner_transpose",
            Self::Im2col(_) => "im2col",
            Self::Weight(_) => "weight_transpose",
            Self::Fractal(_) => "fractal",
        }
    }

    /// Returns true if references to `tensor` keep their layout.
    #[must_use]
    pub fn not_need_construct(&self, tensor: &str) -> bool {
        match self {
            Self::GemmTranspose { matrix }
            | Self::GemmTransposeBlock { matrix }
            | Self::GemmInnerTranspose { matrix } => matrix != tensor,
            Self::Im2col(conv) | Self::Fractal(conv) => {
                !conv.feature_name.is_empty() && conv.feature_name != tensor
            }
            Self::Weight(conv) => conv.feature_name == tensor,
        }
    }

    /// New coordinates over the old ones, for [`tpo_poly::AccessMap::then`].
    ///
    /// For [`Remapper::Fractal`] the old coordinates are the im2col ones.
    ///
    /// # Errors
    ///
    /// im2col has no forward function, and every remapper checks the rank
    /// and kernel attributes it needs.
    pub fn forward(&self, rank: usize) -> PolyResult<Vec<IndexExpr>> {
        match self {
            Self::GemmTranspose { .. } => gemm_permutation(rank, [1, 0, 3, 2]),
            Self::GemmTransposeBlock { .. } => gemm_permutation(rank, [1, 0, 2, 3]),
            Self::GemmInnerTranspose { .. } => gemm_permutation(rank, [0, 1, 3, 2]),
            Self::Im2col(_) => Err(PolyError::NotInvertible("im2col".to_string())),
            Self::Weight(conv) => {
                expect_rank("weight operand rank", rank, 4)?;
                let (kh, kw) = kernel(conv)?;
                Ok(vec![
                    IndexExpr::var(4, 0).scale(-1).offset(kh - 1),
                    IndexExpr::var(4, 1).scale(-1).offset(kw - 1),
                    IndexExpr::var(4, 3),
                    IndexExpr::var(4, 2),
                ])
            }
            Self::Fractal(conv) => {
                expect_rank("im2col rank", rank, 6)?;
                let (kh, kw) = kernel(conv)?;
                Ok(vec![
                    IndexExpr::var(6, 0),
                    IndexExpr::var(6, 1).floor_div(FRACTAL_BLOCK),
                    IndexExpr::from(Aff::var(6, 2) * (kh * kw) + Aff::var(6, 3) * kw + Aff::var(6, 4)),
                    IndexExpr::var(6, 1).modulo(FRACTAL_BLOCK),
                    IndexExpr::var(6, 5),
                ])
            }
        }
    }

    /// The footprint of the remapped operand.
    ///
    /// # Errors
    ///
    /// Fails when the input box has the wrong rank or the kernel size is
    /// not configured.
    pub fn remap_box(&self, input: &FootprintBox) -> FootprintResult<FootprintBox> {
        match self {
            Self::Im2col(conv) => im2col_box(conv, input),
            Self::Fractal(conv) => {
                let cols = im2col_box(conv, input)?;
                Ok(apply_forward(&self.forward(cols.rank())?, &cols))
            }
            _ => Ok(apply_forward(&self.forward(input.rank())?, input)),
        }
    }

    /// Original tensor coordinates over the remapped ones. `input` is the
    /// footprint in the original layout.
    ///
    /// # Errors
    ///
    /// Same conditions as [`Remapper::remap_box`].
    pub fn source_index(&self, input: &FootprintBox) -> FootprintResult<Vec<IndexExpr>> {
        match self {
            // these remappers are involutions
            Self::GemmTranspose { .. }
            | Self::GemmTransposeBlock { .. }
            | Self::GemmInnerTranspose { .. }
            | Self::Weight(_) => Ok(self.forward(input.rank())?),
            Self::Im2col(conv) => im2col_source(conv, input),
            Self::Fractal(conv) => {
                let (kh, kw) = kernel(conv)?;
                let fractal = vec![
                    IndexExpr::var(5, 0),
                    IndexExpr::from(Aff::var(5, 1) * FRACTAL_BLOCK + Aff::var(5, 3)),
                    IndexExpr::var(5, 2).floor_div(kh * kw),
                    IndexExpr::var(5, 2).floor_div(kw).modulo(kh),
                    IndexExpr::var(5, 2).modulo(kw),
                    IndexExpr::var(5, 4),
                ];
                let cols = im2col_source(conv, input)?;
                Ok(cols.iter().map(|e| e.compose(&fractal)).collect())
            }
        }
    }
}

fn expect_rank(what: &'static str, rank: usize, expected: usize) -> PolyResult<()> {
    if rank == expected {
        Ok(())
    } else {
        Err(PolyError::DimMismatch {
            what,
            expected,
            found: rank,
        })
    }
}

fn kernel(conv: &ConvAttrs) -> PolyResult<(i64, i64)> {
    if conv.kernel_h > 0 && conv.kernel_w > 0 {
        Ok((conv.kernel_h, conv.kernel_w))
    } else {
        Err(PolyError::Unsupported(
            "convolution remapping needs kernel_h and kernel_w".to_string(),
        ))
    }
}

/// Identity on the leading dimensions, `perm` on the last four.
fn gemm_permutation(rank: usize, perm: [usize; 4]) -> PolyResult<Vec<IndexExpr>> {
    if rank < 4 {
        return Err(PolyError::DimMismatch {
            what: "gemm operand rank",
            expected: 4,
            found: rank,
        });
    }
    let lead = rank - 4;
    Ok((0..lead)
        .map(|d| IndexExpr::var(rank, d))
        .chain(perm.iter().map(|&p| IndexExpr::var(rank, lead + p)))
        .collect())
}

/// Bounds every remapped coordinate over `input`. Coordinates that copy a
/// single old one keep its stride and size.
fn apply_forward(forward: &[IndexExpr], input: &FootprintBox) -> FootprintBox {
    let ranges: Option<Vec<VarRange>> = (0..input.rank())
        .map(|d| {
            input.sizes[d].map(|s| VarRange {
                lower: input.offsets[d].clone(),
                size: (s - 1) * input.strides[d] + 1,
            })
        })
        .collect();
    let n = input.offsets.first().map_or(0, Aff::dim);
    let mut strides = Vec::with_capacity(forward.len());
    let mut offsets = Vec::with_capacity(forward.len());
    let mut sizes = Vec::with_capacity(forward.len());
    for expr in forward {
        let span = ranges.as_ref().and_then(|r| expr.span(r));
        let Some(span) = span else {
            strides.push(1);
            offsets.push(Aff::zero(n));
            sizes.push(None);
            continue;
        };
        match expr.as_aff().and_then(Aff::single_var) {
            Some((v, c)) if c.abs() == 1 => {
                strides.push(input.strides[v]);
                sizes.push(input.sizes[v]);
            }
            _ => {
                strides.push(1);
                sizes.push(Some(span.span + 1));
            }
        }
        offsets.push(span.lo);
    }
    let bounded = sizes.iter().all(Option::is_some);
    FootprintBox {
        strides,
        offsets,
        sizes,
        valid: input.valid && bounded,
        invalid_dims: Vec::new(),
        should_split: input.should_split,
        determinants: Vec::new(),
    }
}

fn check_conv_input(input: &FootprintBox) -> FootprintResult<()> {
    if input.rank() == 5 {
        Ok(())
    } else {
        Err(FootprintError::DimMismatch {
            relation: "im2col input (N, C1, H, W, C0)".to_string(),
            expected: 5,
            found: input.rank(),
        })
    }
}

/// Output rows and columns covered by the input tile.
///
/// # Errors
///
/// Fails when the kernel size is not configured.
pub fn im2col_geometry(conv: &ConvAttrs, input: &FootprintBox) -> FootprintResult<Im2colGeometry> {
    let (kh, kw) = kernel(conv)?;
    let tile_h = if conv.tile_h > 0 {
        conv.tile_h
    } else {
        input.sizes.get(2).copied().flatten().unwrap_or(conv.feature_h)
    };
    let tile_w = if conv.tile_w > 0 {
        conv.tile_w
    } else {
        input.sizes.get(3).copied().flatten().unwrap_or(conv.feature_w)
    };
    let kh_d = (kh - 1) * conv.dilation_h.max(1) + 1;
    let kw_d = (kw - 1) * conv.dilation_w.max(1) + 1;
    Ok(Im2colGeometry {
        ho: ((tile_h - kh_d) / conv.stride_h.max(1) + 1).max(1),
        wo: ((tile_w - kw_d) / conv.stride_w.max(1) + 1).max(1),
    })
}

fn im2col_box(conv: &ConvAttrs, input: &FootprintBox) -> FootprintResult<FootprintBox> {
    check_conv_input(input)?;
    let (kh, kw) = kernel(conv)?;
    let geo = im2col_geometry(conv, input)?;
    let n = input.offsets.first().map_or(0, Aff::dim);
    let copied = |d: usize| (input.strides[d], input.offsets[d].clone(), input.sizes[d]);
    let fresh = |size: i64| (1, Aff::zero(n), Some(size));
    let dims = [
        copied(0),
        fresh(geo.ho * geo.wo),
        copied(1),
        fresh(kh),
        fresh(kw),
        copied(4),
    ];
    let sizes: Vec<Option<i64>> = dims.iter().map(|d| d.2).collect();
    let bounded = sizes.iter().all(Option::is_some);
    Ok(FootprintBox {
        strides: dims.iter().map(|d| d.0).collect(),
        offsets: dims.iter().map(|d| d.1.clone()).collect(),
        sizes,
        valid: input.valid && bounded,
        invalid_dims: Vec::new(),
        should_split: input.should_split,
        determinants: Vec::new(),
    })
}

/// `(N, C1, H, W, C0)` over `(N, ho·wo, C1, kh, kw, C0)`.
fn im2col_source(conv: &ConvAttrs, input: &FootprintBox) -> FootprintResult<Vec<IndexExpr>> {
    check_conv_input(input)?;
    let geo = im2col_geometry(conv, input)?;
    let row_base = constant_offset(input, 2);
    let col_base = constant_offset(input, 3);
    let y = |d| IndexExpr::var(6, d);
    Ok(vec![
        y(0),
        y(2),
        y(1)
            .floor_div(geo.wo)
            .scale(conv.stride_h.max(1))
            .plus(y(3).scale(conv.dilation_h.max(1)))
            .offset(row_base - conv.pad_top),
        y(1)
            .modulo(geo.wo)
            .scale(conv.stride_w.max(1))
            .plus(y(4).scale(conv.dilation_w.max(1)))
            .offset(col_base - conv.pad_left),
        y(5),
    ])
}

fn constant_offset(input: &FootprintBox, d: usize) -> i64 {
    input
        .offsets
        .get(d)
        .filter(|o| o.is_constant())
        .map_or(0, Aff::constant_term)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dense(sizes: &[i64]) -> FootprintBox {
        FootprintBox {
            strides: vec![1; sizes.len()],
            offsets: vec![Aff::zero(0); sizes.len()],
            sizes: sizes.iter().copied().map(Some).collect(),
            valid: true,
            invalid_dims: Vec::new(),
            should_split: false,
            determinants: Vec::new(),
        }
    }

    fn conv() -> ConvAttrs {
        ConvAttrs {
            feature_name: "fmap".to_string(),
            kernel_h: 3,
            kernel_w: 3,
            pad_top: 1,
            pad_left: 1,
            ..ConvAttrs::default()
        }
    }

    #[test]
    fn test_gemm_permutations() {
        let inner = Remapper::GemmInnerTranspose { matrix: "B".into() };
        let out = inner.remap_box(&dense(&[2, 4, 16, 8])).unwrap();
        assert_eq!(out.fixed_sizes(), Some(vec![2, 4, 8, 16]));

        let full = Remapper::GemmTranspose { matrix: "B".into() };
        let out = full.remap_box(&dense(&[5, 2, 4, 16, 8])).unwrap();
        assert_eq!(out.fixed_sizes(), Some(vec![5, 4, 2, 8, 16]));

        let block = Remapper::GemmTransposeBlock { matrix: "B".into() };
        let out = block.remap_box(&dense(&[2, 4, 16, 8])).unwrap();
        assert_eq!(out.fixed_sizes(), Some(vec![4, 2, 16, 8]));

        assert!(block.not_need_construct("A"));
        assert!(!block.not_need_construct("B"));
        assert!(matches!(block.forward(3), Err(PolyError::DimMismatch { .. })));
    }

    #[test]
    fn test_weight_reverses_kernel() {
        let weight = Remapper::Weight(conv());
        let f = weight.forward(4).unwrap();
        let point: Vec<i64> = f.iter().map(|e| e.eval(&[0, 2, 5, 7]).unwrap()).collect();
        assert_eq!(point, vec![2, 0, 7, 5]);
        assert!(weight.not_need_construct("fmap"));
        assert!(!weight.not_need_construct("filter"));
    }

    #[test]
    fn test_im2col_box_and_source() {
        let im2col = Remapper::Im2col(conv());
        // N=1, C1=2, H=6, W=6, C0=16 with a 3x3 kernel: 4x4 output plane
        let input = dense(&[1, 2, 6, 6, 16]);
        let out = im2col.remap_box(&input).unwrap();
        assert_eq!(out.fixed_sizes(), Some(vec![1, 16, 2, 3, 3, 16]));
        assert!(matches!(im2col.forward(5), Err(PolyError::NotInvertible(_))));

        let src = im2col.source_index(&input).unwrap();
        // output position 5 = row 1, col 1; kernel tap (2, 0)
        let x: Vec<i64> = src.iter().map(|e| e.eval(&[0, 5, 1, 2, 0, 3]).unwrap()).collect();
        assert_eq!(x, vec![0, 1, 1 + 2 - 1, 1 - 1, 3]);
    }

    #[test]
    fn test_fractal_blocks_output_positions() {
        let fractal = Remapper::Fractal(conv());
        let input = dense(&[1, 2, 6, 6, 16]);
        let out = fractal.remap_box(&input).unwrap();
        // 16 positions = one block of 16; C1·kh·kw = 18
        assert_eq!(out.fixed_sizes(), Some(vec![1, 1, 18, 16, 16]));

        let fwd = fractal.forward(6).unwrap();
        let y: Vec<i64> = fwd.iter().map(|e| e.eval(&[0, 21, 1, 2, 0, 3]).unwrap()).collect();
        assert_eq!(y, vec![0, 1, 9 + 6, 5, 3]);
        assert!(!fractal.not_need_construct("fmap"));
    }
}
