use nalgebra::{DMatrix, DVector};
use num_traits::{One, Zero};
use serde::{Deserialize, Serialize};

use crate::{
    error::{NodesolError, OdeSolverError},
    ode_solver_error,
    scalar::constant,
    Scalar,
};

/// The explicit Runge-Kutta methods the solver can be built with.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum Method {
    /// Dormand-Prince 5(4), the default.
    #[default]
    Dopri5,
    /// Tsitouras 5(4).
    Tsit45,
}

impl Method {
    pub fn tableau<T: Scalar>(&self) -> Tableau<T> {
        match self {
            Method::Dopri5 => Tableau::dopri5(),
            Method::Tsit45 => Tableau::tsit45(),
        }
    }
}

/// A butcher tableau for an explicit Runge-Kutta method.
///
/// The tableau is defined by the matrices `a`, `b`, `c` and `d` and the order of the method.
/// The butchers tableau is often depicted like this example of a 3-stage method:
///
/// ```text
/// c1 | 0   0   0
/// c2 | a21 0   0
/// c3 | a31 a32 0
/// -------------------
///   | b1  b2  b3
///   | be1 be2 be3
/// -------------------
///   | d1  d2  d3
/// ```
///
/// where `be` is the embedded method for error control and `d` is the difference between the main and embedded method.
///
/// For continous extension methods, the beta matrix is also included. Row `i` of beta holds the coefficients of
/// `theta, theta^2, ...` multiplying stage `i`.
#[derive(Clone, Debug)]
pub struct Tableau<T: Scalar> {
    a: DMatrix<T>,
    b: DVector<T>,
    c: DVector<T>,
    d: DVector<T>,
    order: usize,
    beta: Option<DMatrix<T>>,
}

impl<T: Scalar> Tableau<T> {
    /// Dormand-Prince 5(4) method
    /// from J. R. Dormand and P. J. Prince, A family of embedded Runge-Kutta formulae, Journal of Computational and Applied Mathematics 6 (1980) 19-26.
    ///
    /// continuous extension from:
    /// L. F. Shampine, Some Practical Runge-Kutta Formulas, Mathematics of Computation 46 (1986) 135-150.
    pub fn dopri5() -> Self {
        let c = DVector::from_vec(vec![
            0.0,
            1.0 / 5.0,
            3.0 / 10.0,
            4.0 / 5.0,
            8.0 / 9.0,
            1.0,
            1.0,
        ]);

        #[rustfmt::skip]
        let a = DMatrix::from_row_slice(7, 7, &[
            0.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            1.0 / 5.0, 0.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            3.0 / 40.0, 9.0 / 40.0, 0.0, 0.0, 0.0, 0.0, 0.0,
            44.0 / 45.0, -56.0 / 15.0, 32.0 / 9.0, 0.0, 0.0, 0.0, 0.0,
            19372.0 / 6561.0, -25360.0 / 2187.0, 64448.0 / 6561.0, -212.0 / 729.0, 0.0, 0.0, 0.0,
            9017.0 / 3168.0, -355.0 / 33.0, 46732.0 / 5247.0, 49.0 / 176.0, -5103.0 / 18656.0, 0.0, 0.0,
            35.0 / 384.0, 0.0, 500.0 / 1113.0, 125.0 / 192.0, -2187.0 / 6784.0, 11.0 / 84.0, 0.0,
        ]);

        let b = DVector::from_vec(vec![
            35.0 / 384.0,
            0.0,
            500.0 / 1113.0,
            125.0 / 192.0,
            -2187.0 / 6784.0,
            11.0 / 84.0,
            0.0,
        ]);

        let b_hat = DVector::from_vec(vec![
            5179.0 / 57600.0,
            0.0,
            7571.0 / 16695.0,
            393.0 / 640.0,
            -92097.0 / 339200.0,
            187.0 / 2100.0,
            1.0 / 40.0,
        ]);
        let d = &b - &b_hat;

        #[rustfmt::skip]
        let beta = DMatrix::from_row_slice(7, 4, &[
            1.0, -8048581381.0 / 2820520608.0, 8663915743.0 / 2820520608.0, -12715105075.0 / 11282082432.0,
            0.0, 0.0, 0.0, 0.0,
            0.0, 131558114200.0 / 32700410799.0, -68118460800.0 / 10900136933.0, 87487479700.0 / 32700410799.0,
            0.0, -1754552775.0 / 470086768.0, 14199869525.0 / 1410260304.0, -10690763975.0 / 1880347072.0,
            0.0, 127303824393.0 / 49829197408.0, -318862633887.0 / 49829197408.0, 701980252875.0 / 199316789632.0,
            0.0, -282668133.0 / 205662961.0, 2019193451.0 / 616988883.0, -1453857185.0 / 822651844.0,
            0.0, 40617522.0 / 29380423.0, -110615467.0 / 29380423.0, 69997945.0 / 29380423.0,
        ]);

        let order = 4;

        Self::new(
            a.map(constant),
            b.map(constant),
            c.map(constant),
            d.map(constant),
            order,
            Some(beta.map(constant)),
        )
    }

    /// Tsitouras 5(4) method
    /// from Ch. Tsitouras, Runge-Kutta pairs of order 5(4) satisfying only the first column simplifying assumption, Computers & Mathematics with Applications 62 (2011) 770-775.
    pub fn tsit45() -> Self {
        let c = DVector::from_vec(vec![
            0.0,
            0.161,
            0.327,
            0.9,
            0.9800255409045097,
            1.0,
            1.0,
        ]);

        let b = DVector::from_vec(vec![
            0.09646076681806523,
            0.01,
            0.4798896504144996,
            1.379008574103742,
            -3.290069515436081,
            2.324710524099774,
            0.0,
        ]);

        let d = DVector::from_vec(vec![
            -0.001_780_011_052_225_777,
            -0.0008164344596567469,
            0.007880878010261995,
            -0.1447110071732629,
            0.5823571654525552,
            -0.45808210592918697,
            0.015151515151515152,
        ]);

        // first column chosen so that each row sums to c
        let mut a = DMatrix::<f64>::zeros(7, 7);
        a[(2, 1)] = 0.335_480_655_492_357;
        a[(3, 1)] = -6.359448489975075;
        a[(4, 1)] = -11.74888356406283;
        a[(5, 1)] = -12.92096931784711;
        a[(3, 2)] = 4.362295432869581;
        a[(4, 2)] = 7.495539342889836;
        a[(5, 2)] = 8.159367898576159;
        a[(4, 3)] = -0.09249506636175525;
        a[(5, 3)] = -0.071_584_973_281_401;
        a[(5, 4)] = -0.02826905039406838;
        for i in 1..7 {
            let a_sum: f64 = (1..i).map(|j| a[(i, j)]).sum();
            a[(i, 0)] = c[i] - a_sum;
        }
        for j in 0..6 {
            a[(6, j)] = b[j];
        }

        #[rustfmt::skip]
        let beta = DMatrix::from_row_slice(7, 4, &[
            1.0, -2.76370619727483, 2.91325546182191, -1.05308849772902,
            0.0, 0.1317, -0.2234, 0.1017,
            0.0, 3.93029623689475, -5.9410338721315, 2.49062728565125,
            0.0, -12.4110771669337, 30.3381886302823, -16.5481028892449,
            0.0, 37.509313416511, -88.1789048947664, 47.3795219628193,
            0.0, -27.8965262891973, 65.0918946747937, -34.8706578614966,
            0.0, 1.5, -4.0, 2.5,
        ]);

        let order = 4;

        Self::new(
            a.map(constant),
            b.map(constant),
            c.map(constant),
            d.map(constant),
            order,
            Some(beta.map(constant)),
        )
    }

    pub fn new(
        a: DMatrix<T>,
        b: DVector<T>,
        c: DVector<T>,
        d: DVector<T>,
        order: usize,
        beta: Option<DMatrix<T>>,
    ) -> Self {
        let s = c.len();
        assert_eq!(a.ncols(), s, "Invalid number of rows in a, expected {s}");
        assert_eq!(a.nrows(), s, "Invalid number of columns in a, expected {s}",);
        assert_eq!(b.len(), s, "Invalid number of elements in b, expected {s}",);
        assert_eq!(d.len(), s, "Invalid number of elements in d, expected {s}",);
        if let Some(beta) = &beta {
            assert_eq!(
                beta.nrows(),
                s,
                "Invalid number of rows in beta, expected {s}",
            );
        }
        Self {
            a,
            b,
            c,
            d,
            order,
            beta,
        }
    }

    /// Check the structure the explicit solver relies on: a strictly lower triangular `a`, `c[0] == 0`, and a last
    /// stage that evaluates `f` at the new solution (first same as last).
    pub fn check_explicit_fsal(&self) -> Result<(), NodesolError> {
        let s = self.s();
        if s < 2 {
            return Err(ode_solver_error!(
                InvalidTableau,
                "explicit solver needs at least two stages"
            ));
        }
        if self.c[0] != T::zero() {
            return Err(ode_solver_error!(InvalidTableau, "c[0] must be zero"));
        }
        for i in 0..s {
            for j in i..s {
                if self.a[(i, j)] != T::zero() {
                    return Err(ode_solver_error!(
                        InvalidTableau,
                        format!("a[{i}, {j}] must be zero for an explicit method")
                    ));
                }
            }
        }
        let tol = constant::<T>(1e3) * T::EPSILON;
        if (self.c[s - 1] - T::one()).abs() > tol
            || (0..s).any(|j| (self.a[(s - 1, j)] - self.b[j]).abs() > tol)
        {
            return Err(ode_solver_error!(
                InvalidTableau,
                "last row of a must equal b and c[s - 1] must be one"
            ));
        }
        Ok(())
    }

    pub fn order(&self) -> usize {
        self.order
    }

    pub fn s(&self) -> usize {
        self.c.len()
    }

    pub fn a(&self) -> &DMatrix<T> {
        &self.a
    }

    pub fn b(&self) -> &DVector<T> {
        &self.b
    }

    pub fn c(&self) -> &DVector<T> {
        &self.c
    }

    pub fn d(&self) -> &DVector<T> {
        &self.d
    }

    pub fn beta(&self) -> Option<&DMatrix<T>> {
        self.beta.as_ref()
    }
}
