//! Plain learned projection: a position-wise dense layer (`receptive_field == 1`)
//! or a 1-D convolution over the sequence axis.
//!
//! Weight layout is `[receptive_field, nx, nf]`, input is channels-last
//! (`[..., nx]`, or `[batch, seq, nx]` when convolving).

use tgpt_core::{Result, Shape, Tensor, TgptError};
use tracing::debug;

use crate::module::Module;
use crate::parameter::{init_rng, Init, Parameter};

/// Padding mode for `receptive_field > 1`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Padding {
    /// No padding; output length `seq - rf + 1`.
    #[default]
    Valid,
    /// Zero padding, `(rf - 1) / 2` before and the rest after; output length `seq`.
    Same,
}

/// Shape record fixed by `configure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProjectionShape {
    pub receptive_field: usize,
    pub nx: usize,
    pub nf: usize,
}

impl ProjectionShape {
    /// Output shape for an input of `input_shape`.
    pub fn output_shape(&self, input_shape: &[usize], padding: Padding) -> Result<Shape> {
        let mut out = input_shape.to_vec();
        let last = out
            .last_mut()
            .ok_or_else(|| TgptError::InvalidAxis { axis: -1, ndim: 0 })?;
        *last = self.nf;
        if self.receptive_field > 1 {
            if out.len() != 3 {
                return Err(TgptError::ShapeMismatch {
                    expected: vec![0, 0, self.nx],
                    got: input_shape.to_vec(),
                });
            }
            out[1] = conv_output_len(input_shape[1], self.receptive_field, padding)?;
        }
        Ok(Shape::from(out))
    }
}

fn conv_output_len(seq: usize, rf: usize, padding: Padding) -> Result<usize> {
    match padding {
        Padding::Same => Ok(seq),
        Padding::Valid if seq >= rf => Ok(seq - rf + 1),
        Padding::Valid => Err(TgptError::ShapeMismatch {
            expected: vec![rf],
            got: vec![seq],
        }),
    }
}

/// Apply a `[rf, nx, nf]` weight and `[nf]` bias to `x`.
///
/// Shared by the plain and low-rank projections, which differ only in how the
/// weight is produced.
pub fn project(x: &Tensor, weight: &Tensor, bias: &Tensor, padding: Padding) -> Result<Tensor> {
    let (rf, nx, nf) = match weight.dims() {
        &[rf, nx, nf] => (rf, nx, nf),
        other => {
            return Err(TgptError::ShapeMismatch {
                expected: vec![0, 0, 0],
                got: other.to_vec(),
            })
        }
    };
    let last = x.shape().last_dim().unwrap_or(0);
    if last != nx {
        return Err(TgptError::ShapeMismatch {
            expected: vec![nx],
            got: vec![last],
        });
    }

    if rf == 1 {
        let mut out_dims: Vec<isize> = x.dims().iter().map(|&d| d as isize).collect();
        if let Some(d) = out_dims.last_mut() {
            *d = nf as isize;
        }
        let w = weight.reshape(&[nx as isize, nf as isize])?;
        let flat = x.reshape(&[-1, nx as isize])?;
        return flat.matmul(&w)?.add(bias)?.reshape(&out_dims);
    }

    conv1d_nlc(x, weight, padding)?.add(bias)
}

/// 1-D convolution, stride 1, channels-last: `[b, seq, nx] * [rf, nx, nf]`.
fn conv1d_nlc(x: &Tensor, weight: &Tensor, padding: Padding) -> Result<Tensor> {
    let (rf, nx, nf) = (weight.dims()[0], weight.dims()[1], weight.dims()[2]);
    let (batch, seq) = match x.dims() {
        &[batch, seq, _] => (batch, seq),
        other => {
            return Err(TgptError::ShapeMismatch {
                expected: vec![0, 0, nx],
                got: other.to_vec(),
            })
        }
    };
    let out_len = conv_output_len(seq, rf, padding)?;
    let pad_before = match padding {
        Padding::Valid => 0,
        Padding::Same => (rf - 1) / 2,
    };

    let x = x.contiguous();
    let w = weight.contiguous();
    let x_data = x
        .as_f32_slice()
        .ok_or(TgptError::UnsupportedDType(x.dtype()))?;
    let w_data = w
        .as_f32_slice()
        .ok_or(TgptError::UnsupportedDType(w.dtype()))?;

    let mut output = vec![0.0f32; batch * out_len * nf];
    for b in 0..batch {
        for t in 0..out_len {
            let out_row = &mut output[(b * out_len + t) * nf..(b * out_len + t + 1) * nf];
            for k in 0..rf {
                // input position for tap k; taps landing in the padding contribute nothing
                let Some(pos) = (t + k).checked_sub(pad_before) else {
                    continue;
                };
                if pos >= seq {
                    continue;
                }
                let x_row = &x_data[(b * seq + pos) * nx..(b * seq + pos + 1) * nx];
                for (c, &xv) in x_row.iter().enumerate() {
                    let w_row = &w_data[(k * nx + c) * nf..(k * nx + c + 1) * nf];
                    for (o, &wv) in out_row.iter_mut().zip(w_row) {
                        *o += xv * wv;
                    }
                }
            }
        }
    }

    Tensor::from_vec(output, &[batch, out_len, nf])
}

struct ConvState {
    shape: ProjectionShape,
    w: Parameter,
    b: Parameter,
}

/// Plain projection with weight `[rf, nx, nf]` and bias `[nf]`.
///
/// `nx` comes from the first configured input.
pub struct Conv1d {
    nf: usize,
    receptive_field: usize,
    padding: Padding,
    trainable: bool,
    seed: Option<u64>,
    state: Option<ConvState>,
}

impl Conv1d {
    pub fn new(nf: usize, receptive_field: usize) -> Self {
        Self {
            nf,
            receptive_field: receptive_field.max(1),
            padding: Padding::Valid,
            trainable: true,
            seed: None,
            state: None,
        }
    }

    pub fn with_padding(mut self, padding: Padding) -> Self {
        self.padding = padding;
        self
    }

    pub fn trainable(mut self, trainable: bool) -> Self {
        self.trainable = trainable;
        self
    }

    /// Seed the weight initializer.
    pub fn with_seed(mut self, seed: u64) -> Self {
        self.seed = Some(seed);
        self
    }

    /// Build an already-configured projection around existing parameters.
    pub fn from_parameters(w: Parameter, b: Parameter, padding: Padding) -> Result<Self> {
        let dims = w.dims();
        let (rf, nx, nf) = match dims[..] {
            [rf, nx, nf] => (rf, nx, nf),
            _ => {
                return Err(TgptError::ShapeMismatch {
                    expected: vec![0, 0, 0],
                    got: dims.clone(),
                })
            }
        };
        if b.dims() != [nf] {
            return Err(TgptError::ShapeMismatch {
                expected: vec![nf],
                got: b.dims(),
            });
        }
        Ok(Self {
            nf,
            receptive_field: rf,
            padding,
            trainable: w.is_trainable(),
            seed: None,
            state: Some(ConvState {
                shape: ProjectionShape {
                    receptive_field: rf,
                    nx,
                    nf,
                },
                w,
                b,
            }),
        })
    }

    pub fn nf(&self) -> usize {
        self.nf
    }

    pub fn receptive_field(&self) -> usize {
        self.receptive_field
    }

    pub fn padding(&self) -> Padding {
        self.padding
    }

    pub fn shape(&self) -> Option<ProjectionShape> {
        self.state.as_ref().map(|s| s.shape)
    }

    pub fn weight(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.w)
    }

    pub fn bias(&self) -> Option<&Parameter> {
        self.state.as_ref().map(|s| &s.b)
    }
}

impl Module for Conv1d {
    fn configure(&mut self, input_shape: &[usize]) -> Result<Shape> {
        let nx = input_shape
            .last()
            .copied()
            .ok_or_else(|| TgptError::InvalidAxis { axis: -1, ndim: 0 })?;
        let shape = ProjectionShape {
            receptive_field: self.receptive_field,
            nx,
            nf: self.nf,
        };

        if let Some(state) = &self.state {
            if state.shape.nx != nx {
                return Err(TgptError::ShapeMismatch {
                    expected: vec![state.shape.nx],
                    got: vec![nx],
                });
            }
            return state.shape.output_shape(input_shape, self.padding);
        }

        let out = shape.output_shape(input_shape, self.padding)?;
        debug!(rf = shape.receptive_field, nx, nf = shape.nf, "configuring Conv1d");
        let mut rng = init_rng(self.seed);
        self.state = Some(ConvState {
            shape,
            w: Parameter::init(
                "w",
                &[shape.receptive_field, nx, shape.nf],
                Init::WEIGHT,
                self.trainable,
                &mut rng,
            ),
            b: Parameter::init("b", &[shape.nf], Init::Zeros, self.trainable, &mut rng),
        });
        Ok(out)
    }

    fn is_configured(&self) -> bool {
        self.state.is_some()
    }

    fn forward(&self, input: &Tensor) -> Result<Tensor> {
        let state = self
            .state
            .as_ref()
            .ok_or_else(|| TgptError::NotConfigured("Conv1d".into()))?;
        project(input, &state.w.read(), &state.b.read(), self.padding)
    }

    fn named_parameters(&self) -> Vec<(String, &Parameter)> {
        match &self.state {
            Some(s) => vec![("w".into(), &s.w), ("b".into(), &s.b)],
            None => vec![],
        }
    }
}
