use burn::tensor::Tensor;
use burn_ndarray::NdArray;
use warpgrid_core::spatial::{Direction, Point, Spacing, Vector};
use warpgrid_core::{DeformationField, FieldUnits, Image};
use warpgrid_registration::{
    MetricForceEvaluator, MeanSquares, SampleStatus, SolverRegistry, SolverSettings, SolverStrategy,
};

type B = NdArray<f32>;

/// Gaussian blob on a [16, 16] grid centred at (cx, 7.5).
fn blob(cx: f64) -> Image<B, 2> {
    let device = Default::default();
    let values: Vec<f32> = (0..256)
        .map(|offset| {
            let dx = (offset % 16) as f64 - cx;
            let dy = (offset / 16) as f64 - 7.5;
            (100.0 * (-(dx * dx + dy * dy) / 18.0).exp()) as f32
        })
        .collect();
    let data = Tensor::<B, 1>::from_floats(values.as_slice(), &device).reshape([16, 16]);
    Image::new(data, Point::origin(), Spacing::uniform(1.0), Direction::identity()).unwrap()
}

fn centre_displacement(field: &DeformationField<B, 2>) -> [f32; 2] {
    let centre = Tensor::<B, 2>::from_floats([[7.5, 7.5]], &Default::default());
    let u: Vec<f32> = field.sample(centre).into_data().iter::<f32>().collect();
    [u[0], u[1]]
}

#[test]
fn test_demons_recovers_translation() {
    let device = Default::default();
    // moving(x) = fixed(x - 1): u should approach (1, 0).
    let fixed = blob(7.5);
    let moving = blob(8.5);
    let registry = SolverRegistry::<B, 2>::with_defaults();
    let settings = SolverSettings::default().with_radius(vec![0]);

    let mut errors = Vec::new();
    for iterations in [1, 40] {
        let mut solver = registry.create("demons", &settings).unwrap();
        let initial = DeformationField::zeros(fixed.grid().clone(), &device);
        let field = solver.run(&fixed, &moving, initial, iterations).unwrap();
        let u = centre_displacement(&field);
        assert!(u[1].abs() < 0.2, "y displacement {} after {} iterations", u[1], iterations);
        errors.push((1.0 - u[0]).abs());
    }

    assert!(errors[1] < errors[0], "error did not decrease: {:?}", errors);
    assert!(errors[1] < 0.5, "translation not recovered: {:?}", errors);
}

#[test]
fn test_zero_iterations_is_identity_for_every_solver() {
    let device = Default::default();
    let fixed = blob(7.5);
    let moving = blob(9.5);
    let registry = SolverRegistry::<B, 2>::with_defaults();
    let initial = DeformationField::constant(fixed.grid().clone(), Vector::new([0.5, -0.25]), FieldUnits::Physical, &device);

    for name in registry.names() {
        let mut solver = registry.create(name, &SolverSettings::default()).unwrap();
        let result = solver.run(&fixed, &moving, initial.clone(), 0).unwrap();
        assert!(result.approx_eq(&initial, 0.0), "{} changed the field", name);
    }
}

#[test]
fn test_out_of_bounds_samples_produce_zero_force() {
    let fixed = blob(7.5);
    let moving = blob(8.5);
    let metric = MeanSquares::new();
    let interpolator = warpgrid_core::interpolation::LinearInterpolator::new();
    let evaluator = MetricForceEvaluator::new(&fixed, &moving, &metric, &interpolator, [1, 1]);

    // Displaced far outside the moving image.
    let pushed_out = evaluator.evaluate(&Point::new([4.0, 4.0]), &Vector::new([40.0, 0.0]));
    assert_eq!(pushed_out.status, SampleStatus::OutOfBounds);
    assert_eq!(pushed_out.value, 0.0);
    assert_eq!(pushed_out.force, Vector::zeros());

    // Outside the fixed image to begin with.
    let outside = evaluator.evaluate(&Point::new([-3.0, 4.0]), &Vector::zeros());
    assert!(!outside.is_inside());
    assert_eq!(outside.force, Vector::zeros());

    // Near the blob flank the force is nonzero and points along +x.
    let inside = evaluator.evaluate(&Point::new([6.0, 7.5]), &Vector::zeros());
    assert!(inside.is_inside());
    assert!(inside.force[0] > 0.0, "force {:?}", inside.force);
}
