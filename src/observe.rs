//! Optional instrumentation hook. Observers see every weight, bias and
//! normalization variable as it is created; they never change what the
//! network computes.
use log::trace;
use tensorflow::ops;
use tensorflow::Output;
use tensorflow::Scope;
use tensorflow::Status;
use tensorflow::Variable;

pub trait VariableObserver {
    /// The variable's name carries its full name scope, e.g.
    /// `Level_1_down/layer/weights`.
    fn observe(&mut self, variable: &Variable) -> Result<(), Status>;
}

/// Default observer, traces each variable.
#[derive(Debug, Default, Clone, Copy)]
pub struct LogObserver;

impl VariableObserver for LogObserver {
    fn observe(&mut self, variable: &Variable) -> Result<(), Status> {
        trace!("variable {} shape {:?}", variable.name(), variable.shape());
        Ok(())
    }
}

/// Keeps the name of every observed variable, in creation order.
#[derive(Debug, Default, Clone)]
pub struct RecordingObserver {
    pub seen: Vec<String>,
}

impl VariableObserver for RecordingObserver {
    fn observe(&mut self, variable: &Variable) -> Result<(), Status> {
        self.seen.push(variable.name().to_string());
        Ok(())
    }
}

/// Scalar statistics of one variable, fetchable alongside any run.
#[derive(Debug, Clone)]
pub struct VariableSummary {
    pub name: String,
    pub mean: Output,
    pub stddev: Output,
    pub min: Output,
    pub max: Output,
}

/// Adds mean, standard deviation, min and max nodes for every observed
/// variable under a `summaries` name scope. The nodes only read the
/// variables.
#[derive(Debug)]
pub struct SummaryObserver {
    scope: Scope,
    pub summaries: Vec<VariableSummary>,
}

impl SummaryObserver {
    pub fn new(scope: &Scope) -> Self {
        SummaryObserver {
            scope: scope.new_sub_scope("summaries"),
            summaries: vec![],
        }
    }

    pub fn get(&self, name: &str) -> Option<&VariableSummary> {
        self.summaries.iter().find(|s| s.name == name)
    }
}

impl VariableObserver for SummaryObserver {
    fn observe(&mut self, variable: &Variable) -> Result<(), Status> {
        let scope = &mut self.scope;
        // flattened, so the reductions run over a single axis whatever the rank
        let flat = ops::constant(&[-1i32][..], scope)?;
        let x: Output = ops::reshape(variable.output().clone(), flat, scope)?.into();
        let axes: Output = ops::constant(&[0i32][..], scope)?.into();

        let mean: Output = ops::mean(x.clone(), axes.clone(), scope)?.into();
        let stddev = ops::sqrt(
            ops::mean(
                ops::square(ops::sub(x.clone(), mean.clone(), scope)?, scope)?,
                axes.clone(),
                scope,
            )?,
            scope,
        )?;
        let min = ops::min(x.clone(), axes.clone(), scope)?;
        let max = ops::max(x, axes, scope)?;
        self.summaries.push(VariableSummary {
            name: variable.name().to_string(),
            mean,
            stddev: stddev.into(),
            min: min.into(),
            max: max.into(),
        });
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tensorflow::{Session, SessionOptions, SessionRunArgs, Tensor};

    #[test]
    fn summaries_report_variable_statistics() {
        let mut scope = Scope::new_root_scope();
        let mut observer = SummaryObserver::new(&scope);
        let values = Tensor::<f32>::new(&[2, 2])
            .with_values(&[1.0, 3.0, 5.0, 7.0])
            .unwrap();
        let var = Variable::builder()
            .const_initial_value(values)
            .build(&mut scope.with_op_name("weights"))
            .unwrap();
        observer.observe(&var).unwrap();
        let summary = observer.get("weights").unwrap().clone();

        let session = Session::new(&SessionOptions::new(), &scope.graph()).unwrap();
        let mut init = SessionRunArgs::new();
        init.add_target(var.initializer());
        session.run(&mut init).unwrap();

        let mut args = SessionRunArgs::new();
        let tokens: Vec<_> = [&summary.mean, &summary.stddev, &summary.min, &summary.max]
            .iter()
            .map(|o| args.request_fetch(&o.operation, o.index))
            .collect();
        session.run(&mut args).unwrap();
        let got: Vec<f32> = tokens
            .into_iter()
            .map(|t| args.fetch::<f32>(t).unwrap()[0])
            .collect();
        // mean 4, population stddev sqrt(5)
        assert!((got[0] - 4.0).abs() < 1e-6);
        assert!((got[1] - 5.0f32.sqrt()).abs() < 1e-5);
        assert_eq!(&got[2..], &[1.0, 7.0]);
    }
}
