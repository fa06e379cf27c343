use std::collections::BTreeMap;
use std::f64::consts::PI;

use playbonk::*;

fn main() -> Result<()> {
    let mut pg = Playground::new(PlaygroundConfig::default())?;

    let spec = AgentSpec::basic("scout", 10.0)
        .with_sensor(SensorSpec::new("depth", SensorKind::Distance, "base").with_fan(PI, 9, 150.0))
        .with_sensor(SensorSpec::new("ids", SensorKind::Semantic, "base").with_fan(PI, 9, 150.0));
    pg.add_agent(spec, (0.0, 0.0), false)?;

    pg.add_element(EntitySpec::new(ShapeDescriptor::rectangle(20.0, 80.0)).with_color([0.9, 0.2, 0.2]), (80.0, 0.0), false)?;
    pg.add_element(EntitySpec::new(ShapeDescriptor::circle(8.0)).with_mass(1.0), (30.0, 60.0), false)?;

    let commands: Commands = BTreeMap::from([(
        "scout".to_string(),
        BTreeMap::from([("forward".to_string(), CommandValue::from(1.0))]),
    )]);

    for _ in 0..3 {
        let out = pg.step(&commands)?;
        let obs = &out.observations["scout"];
        println!("t={} depth={:?}", out.info.timestep, obs["depth"].data);
        let ids: Vec<f32> = obs["ids"].data.chunks(3).map(|c| c[0]).collect();
        println!("     ids={ids:?}");
    }

    let scout = pg.agent_by_name("scout").map(|a| a.base);
    if let Some(pose) = scout.and_then(|uid| pg.entity_pose(uid)) {
        println!("scout at ({:.2}, {:.2})", pose.position.x, pose.position.y);
    }
    Ok(())
}
