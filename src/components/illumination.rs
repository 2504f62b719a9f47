//! Polynomial illumination fields
//!
//! [`PolynomialIllumination`] is a tensor-product series over normalized
//! frame coordinates in `[-1, 1]`, in either the Legendre or the plain power
//! basis. [`SeparableIllumination`] joins an in-plane polynomial `P(x, y)`
//! with an axial one `Q(z)`. Every coefficient touches the whole frame.

use ndarray::Array3;

use crate::component::{Category, Component, RenderContext};
use crate::error::{ReconError, Result};
use crate::parameters::Parameter;
use crate::region::{Support, Tile};

/// Legendre polynomial `P_n(u)` by the three-term recurrence
pub fn legendre(n: usize, u: f64) -> f64 {
    match n {
        0 => 1.0,
        1 => u,
        _ => {
            let (mut p0, mut p1) = (1.0, u);
            for k in 1..n {
                let kf = k as f64;
                let p2 = ((2.0 * kf + 1.0) * u * p1 - kf * p0) / (kf + 1.0);
                p0 = p1;
                p1 = p2;
            }
            p1
        }
    }
}

/// One-dimensional polynomial family used along each axis
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PolynomialBasis {
    /// Legendre polynomials `P_n(u)`
    #[default]
    Legendre,
    /// Monomials `u^n`
    Power,
}

impl PolynomialBasis {
    /// Value of the `n`-th basis function at `u`
    pub fn eval(self, n: usize, u: f64) -> f64 {
        match self {
            PolynomialBasis::Legendre => legendre(n, u),
            PolynomialBasis::Power => u.powi(n as i32),
        }
    }
}

/// Map pixel index `i` of an axis of length `n` to `[-1, 1]`
pub(crate) fn normalized(i: usize, n: usize) -> f64 {
    if n <= 1 {
        0.0
    } else {
        2.0 * i as f64 / (n - 1) as f64 - 1.0
    }
}

/// Multiplicative illumination `I(z, y, x) = Σ c_ijk P_i(z) P_j(y) P_k(x)`
#[derive(Debug, Clone)]
pub struct PolynomialIllumination {
    prefix: String,
    /// Number of terms per axis
    order: [usize; 3],
    /// Value of the constant coefficient at declaration
    constant: f64,
    basis: PolynomialBasis,
}

impl PolynomialIllumination {
    /// Create an illumination with `order[axis]` terms along each axis
    ///
    /// Initially the field is the constant `constant`.
    pub fn new(order: [usize; 3], constant: f64) -> Result<Self> {
        if order.iter().any(|&o| o == 0) {
            return Err(ReconError::InvalidInput(
                "Illumination needs at least one term per axis".to_string(),
            ));
        }
        Ok(Self {
            prefix: "ilm-".to_string(),
            order,
            constant,
            basis: PolynomialBasis::Legendre,
        })
    }

    /// Plain power series `Σ c_ijk z^i y^j x^k` over normalized coordinates
    pub fn power(order: [usize; 3], constant: f64) -> Result<Self> {
        Ok(Self::new(order, constant)?.with_basis(PolynomialBasis::Power))
    }

    /// Use a different polynomial family
    pub fn with_basis(mut self, basis: PolynomialBasis) -> Self {
        self.basis = basis;
        self
    }

    /// Polynomial family along each axis
    pub fn basis_kind(&self) -> PolynomialBasis {
        self.basis
    }

    /// Use a different parameter-name prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// Parameter name of coefficient `(i, j, k)`
    pub fn coefficient_name(&self, i: usize, j: usize, k: usize) -> String {
        format!("{}{}-{}-{}", self.prefix, i, j, k)
    }

    fn terms(&self) -> Vec<[usize; 3]> {
        let mut terms = Vec::with_capacity(self.order.iter().product());
        for i in 0..self.order[0] {
            for j in 0..self.order[1] {
                for k in 0..self.order[2] {
                    terms.push([i, j, k]);
                }
            }
        }
        terms
    }

    fn parse(&self, name: &str) -> Option<[usize; 3]> {
        let rest = name.strip_prefix(&self.prefix)?;
        let mut parts = rest.split('-').map(|p| p.parse::<usize>().ok());
        let term = [parts.next()??, parts.next()??, parts.next()??];
        if parts.next().is_some() || (0..3).any(|a| term[a] >= self.order[a]) {
            return None;
        }
        Some(term)
    }

    fn basis(&self, term: [usize; 3], pixel: [usize; 3], frame: &Tile) -> f64 {
        let shape = frame.shape();
        (0..3)
            .map(|a| {
                self.basis
                    .eval(term[a], normalized(pixel[a] - frame.lo[a], shape[a]))
            })
            .product()
    }
}

impl Component for PolynomialIllumination {
    fn label(&self) -> &str {
        "illumination"
    }

    fn category(&self) -> Category {
        Category::Illumination
    }

    fn initial_parameters(&self) -> Result<Vec<Parameter>> {
        Ok(self
            .terms()
            .into_iter()
            .map(|[i, j, k]| {
                let value = if i + j + k == 0 { self.constant } else { 0.0 };
                Parameter::new(&self.coefficient_name(i, j, k), value)
            })
            .collect())
    }

    fn parameters(&self) -> Vec<String> {
        self.terms()
            .into_iter()
            .map(|[i, j, k]| self.coefficient_name(i, j, k))
            .collect()
    }

    fn support(&self, name: &str, _ctx: &RenderContext<'_>) -> Result<Support> {
        self.parse(name)
            .map(|_| Support::Global)
            .ok_or_else(|| ReconError::ParameterNotFound(name.to_string()))
    }

    fn render(&self, ctx: &RenderContext<'_>, tile: &Tile) -> Result<Array3<f64>> {
        let coefficients = self
            .terms()
            .into_iter()
            .map(|[i, j, k]| Ok(([i, j, k], ctx.value(&self.coefficient_name(i, j, k))?)))
            .collect::<Result<Vec<_>>>()?;
        let frame = ctx.frame;

        ctx.evaluator.evaluate(tile, &|pixel| {
            coefficients
                .iter()
                .map(|&(term, c)| c * self.basis(term, pixel, &frame))
                .sum()
        })
    }

    fn derivative(
        &self,
        name: &str,
        ctx: &RenderContext<'_>,
        tile: &Tile,
    ) -> Option<Result<Array3<f64>>> {
        let term = self.parse(name)?;
        let frame = ctx.frame;
        Some(
            ctx.evaluator
                .evaluate(tile, &|pixel| self.basis(term, pixel, &frame)),
        )
    }
}

/// How the in-plane and axial polynomials of a [`SeparableIllumination`]
/// combine
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum AxialJoin {
    /// `I = P(x, y) · Q(z)`
    #[default]
    Product,
    /// `I = P(x, y) + Q(z)`
    Sum,
}

/// Coefficient of a separable illumination
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum SeparableTerm {
    /// `x^i y^j` in the plane
    Plane(usize, usize),
    /// `z^k` along the axis
    Axial(usize),
}

/// Illumination split into an in-plane polynomial and an axial one
///
/// Coefficients are named `ilm-xy-i-j` (power `i` in x, `j` in y) and
/// `ilm-z-k`. With [`AxialJoin::Product`] the field starts as
/// `constant · 1`; with [`AxialJoin::Sum`] it starts as `constant + 0`.
#[derive(Debug, Clone)]
pub struct SeparableIllumination {
    prefix: String,
    /// Terms along z, y and x
    order: [usize; 3],
    constant: f64,
    join: AxialJoin,
    basis: PolynomialBasis,
}

impl SeparableIllumination {
    /// Create a separable illumination with `order[axis]` terms per axis
    pub fn new(order: [usize; 3], constant: f64, join: AxialJoin) -> Result<Self> {
        if order.iter().any(|&o| o == 0) {
            return Err(ReconError::InvalidInput(
                "Illumination needs at least one term per axis".to_string(),
            ));
        }
        Ok(Self {
            prefix: "ilm-".to_string(),
            order,
            constant,
            join,
            basis: PolynomialBasis::Power,
        })
    }

    /// Use a different polynomial family
    pub fn with_basis(mut self, basis: PolynomialBasis) -> Self {
        self.basis = basis;
        self
    }

    /// Use a different parameter-name prefix
    pub fn with_prefix(mut self, prefix: &str) -> Self {
        self.prefix = prefix.to_string();
        self
    }

    /// How the two polynomials combine
    pub fn join(&self) -> AxialJoin {
        self.join
    }

    fn terms(&self) -> Vec<SeparableTerm> {
        let mut terms = Vec::with_capacity(self.order[2] * self.order[1] + self.order[0]);
        for i in 0..self.order[2] {
            for j in 0..self.order[1] {
                terms.push(SeparableTerm::Plane(i, j));
            }
        }
        terms.extend((0..self.order[0]).map(SeparableTerm::Axial));
        terms
    }

    fn name(&self, term: SeparableTerm) -> String {
        match term {
            SeparableTerm::Plane(i, j) => format!("{}xy-{}-{}", self.prefix, i, j),
            SeparableTerm::Axial(k) => format!("{}z-{}", self.prefix, k),
        }
    }

    fn parse(&self, name: &str) -> Option<SeparableTerm> {
        let rest = name.strip_prefix(&self.prefix)?;
        let term = if let Some(plane) = rest.strip_prefix("xy-") {
            let (i, j) = plane.split_once('-')?;
            SeparableTerm::Plane(i.parse().ok()?, j.parse().ok()?)
        } else {
            SeparableTerm::Axial(rest.strip_prefix("z-")?.parse().ok()?)
        };
        let valid = match term {
            SeparableTerm::Plane(i, j) => i < self.order[2] && j < self.order[1],
            SeparableTerm::Axial(k) => k < self.order[0],
        };
        valid.then_some(term)
    }

    fn basis(&self, term: SeparableTerm, pixel: [usize; 3], frame: &Tile) -> f64 {
        let shape = frame.shape();
        let u = |a: usize| normalized(pixel[a] - frame.lo[a], shape[a]);
        match term {
            SeparableTerm::Plane(i, j) => self.basis.eval(i, u(2)) * self.basis.eval(j, u(1)),
            SeparableTerm::Axial(k) => self.basis.eval(k, u(0)),
        }
    }

    /// In-plane and axial polynomial values at `pixel`
    fn factors(
        &self,
        coefficients: &[(SeparableTerm, f64)],
        pixel: [usize; 3],
        frame: &Tile,
    ) -> (f64, f64) {
        coefficients
            .iter()
            .fold((0.0, 0.0), |(plane, axial), &(term, c)| match term {
                SeparableTerm::Plane(..) => (plane + c * self.basis(term, pixel, frame), axial),
                SeparableTerm::Axial(_) => (plane, axial + c * self.basis(term, pixel, frame)),
            })
    }

    fn coefficients(&self, ctx: &RenderContext<'_>) -> Result<Vec<(SeparableTerm, f64)>> {
        self.terms()
            .into_iter()
            .map(|term| Ok((term, ctx.value(&self.name(term))?)))
            .collect()
    }
}

impl Component for SeparableIllumination {
    fn label(&self) -> &str {
        "separable illumination"
    }

    fn category(&self) -> Category {
        Category::Illumination
    }

    fn initial_parameters(&self) -> Result<Vec<Parameter>> {
        Ok(self
            .terms()
            .into_iter()
            .map(|term| {
                let value = match (term, self.join) {
                    (SeparableTerm::Plane(0, 0), _) => self.constant,
                    (SeparableTerm::Axial(0), AxialJoin::Product) => 1.0,
                    _ => 0.0,
                };
                Parameter::new(&self.name(term), value)
            })
            .collect())
    }

    fn parameters(&self) -> Vec<String> {
        self.terms().into_iter().map(|term| self.name(term)).collect()
    }

    fn support(&self, name: &str, _ctx: &RenderContext<'_>) -> Result<Support> {
        self.parse(name)
            .map(|_| Support::Global)
            .ok_or_else(|| ReconError::ParameterNotFound(name.to_string()))
    }

    fn render(&self, ctx: &RenderContext<'_>, tile: &Tile) -> Result<Array3<f64>> {
        let coefficients = self.coefficients(ctx)?;
        let frame = ctx.frame;
        ctx.evaluator.evaluate(tile, &|pixel| {
            let (plane, axial) = self.factors(&coefficients, pixel, &frame);
            match self.join {
                AxialJoin::Product => plane * axial,
                AxialJoin::Sum => plane + axial,
            }
        })
    }

    fn derivative(
        &self,
        name: &str,
        ctx: &RenderContext<'_>,
        tile: &Tile,
    ) -> Option<Result<Array3<f64>>> {
        let term = self.parse(name)?;
        let frame = ctx.frame;
        if self.join == AxialJoin::Sum {
            return Some(
                ctx.evaluator
                    .evaluate(tile, &|pixel| self.basis(term, pixel, &frame)),
            );
        }
        let coefficients = match self.coefficients(ctx) {
            Ok(coefficients) => coefficients,
            Err(err) => return Some(Err(err)),
        };
        Some(ctx.evaluator.evaluate(tile, &|pixel| {
            let (plane, axial) = self.factors(&coefficients, pixel, &frame);
            let other = match term {
                SeparableTerm::Plane(..) => axial,
                SeparableTerm::Axial(_) => plane,
            };
            self.basis(term, pixel, &frame) * other
        }))
    }
}
