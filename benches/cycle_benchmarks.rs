use criterion::{black_box, criterion_group, criterion_main, Criterion};
use patchwork::{ClientId, Control, Engine, EngineConfig, PortFlags, DEFAULT_AUDIO_TYPE};

fn gain(engine: &mut Engine, name: &str, amount: f32) -> ClientId {
    let client = engine.open_client(name).unwrap();
    let input = engine.register_port(client, "in", DEFAULT_AUDIO_TYPE, PortFlags::IS_INPUT, 0).unwrap();
    let output = engine.register_port(client, "out", DEFAULT_AUDIO_TYPE, PortFlags::IS_OUTPUT, 0).unwrap();
    engine
        .set_process_callback(client, move |scope| {
            let input = scope.input(input).unwrap_or(&[]);
            if let Some(out) = scope.output(output) {
                for (o, i) in out.iter_mut().zip(input) {
                    *o = black_box(i * amount + 0.001);
                }
            }
            Control::Continue
        })
        .unwrap();
    engine.activate(client).unwrap();
    client
}

pub fn criterion_benchmark(c: &mut Criterion) {
    c.bench_function("run_cycle() 16 chained clients", |b| {
        let (mut engine, mut processor) = Engine::new(EngineConfig::default().with_buffer_size(256)).unwrap();
        let mut previous: Option<String> = None;
        for i in 0..16 {
            let name = format!("gain_{}", i);
            let client = gain(&mut engine, &name, 0.9);
            if let Some(upstream) = previous.replace(name.clone()) {
                engine
                    .connect(client, &format!("{}:out", upstream), &format!("{}:in", name))
                    .unwrap();
            }
        }

        b.iter(|| processor.run_cycle(black_box(256)));
        drop(engine);
    });

    c.bench_function("run_cycle() 8 sources into one input", |b| {
        let (mut engine, mut processor) = Engine::new(EngineConfig::default().with_buffer_size(256)).unwrap();
        let sink = gain(&mut engine, "sink", 1.0);
        for i in 0..8 {
            let name = format!("source_{}", i);
            gain(&mut engine, &name, 0.5);
            engine.connect(sink, &format!("{}:out", name), "sink:in").unwrap();
        }

        b.iter(|| processor.run_cycle(black_box(256)));
        drop(engine);
    });

    c.bench_function("graph change reschedule", |b| {
        let (mut engine, mut processor) = Engine::new(EngineConfig::default()).unwrap();
        let a = gain(&mut engine, "a", 1.0);
        gain(&mut engine, "b", 1.0);

        b.iter(|| {
            engine.connect(a, "a:out", "b:in").unwrap();
            engine.disconnect(a, "a:out", "b:in").unwrap();
            processor.run_cycle(64);
            engine.maintain();
        });
    });
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
