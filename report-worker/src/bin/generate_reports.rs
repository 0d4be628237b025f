use chrono::Utc;
use common_kafka::config::KafkaConfig;
use common_kafka::kafka_producer::{create_kafka_producer, send_iter_to_kafka};
use envconfig::Envconfig;
use health::HealthRegistry;
use rand::rngs::ThreadRng;
use rand::Rng;
use report_worker::types::{Equipment, Metadata, ReportFields, ReportV1, ReportV2};
use serde_json::Value;

#[derive(Envconfig)]
struct GeneratorConfig {
    #[envconfig(nested = true)]
    kafka: KafkaConfig,

    #[envconfig(default = "report")]
    report_topic: String,

    #[envconfig(default = "100000")]
    generate_count: usize,

    // Reports are drawn between this many distinct players
    #[envconfig(default = "500")]
    generate_players: i64,

    // Share of reports sent as V2, using ids 1..=GENERATE_PLAYERS
    #[envconfig(default = "0")]
    generate_v2_percent: u32,

    #[envconfig(default = "1000")]
    generate_chunk_size: usize,
}

fn random_equipment(rng: &mut ThreadRng) -> Equipment {
    let mut slot = || rng.gen_bool(0.7).then(|| rng.gen_range(0..30_000));
    Equipment {
        equip_head_id: slot(),
        equip_amulet_id: slot(),
        equip_torso_id: slot(),
        equip_legs_id: slot(),
        equip_boots_id: slot(),
        equip_cape_id: slot(),
        equip_hands_id: slot(),
        equip_weapon_id: slot(),
        equip_shield_id: slot(),
    }
}

fn generate_report(rng: &mut ThreadRng, config: &GeneratorConfig) -> Result<Value, serde_json::Error> {
    let players = config.generate_players.max(2);
    let reporter = rng.gen_range(1..=players);
    // Never the reporter itself
    let reported = (reporter + rng.gen_range(1..players) - 1) % players + 1;

    let fields = ReportFields {
        region_id: rng.gen_range(0..16_000),
        x_coord: rng.gen_range(0..4_000),
        y_coord: rng.gen_range(0..10_000),
        z_coord: rng.gen_range(0..4),
        ts: Utc::now().timestamp() - rng.gen_range(0..3_600),
        manual_detect: rng.gen_bool(0.05),
        on_members_world: i32::from(rng.gen_bool(0.5)),
        on_pvp_world: rng.gen_bool(0.1),
        world_number: rng.gen_range(301..=580),
        equipment: random_equipment(rng),
        equip_ge_value: rng.gen_range(0..10_000_000),
    };

    if rng.gen_range(0..100) < config.generate_v2_percent {
        serde_json::to_value(ReportV2 {
            reporter_id: reporter,
            reported_id: reported,
            fields,
            metadata: Metadata::v2(),
        })
    } else {
        serde_json::to_value(ReportV1 {
            reporter: format!("player {reporter}"),
            reported: format!("player {reported}"),
            fields,
        })
    }
}

// Pushes a stream of synthetic reports onto the report topic
#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let config = GeneratorConfig::init_from_env()?;
    let liveness = HealthRegistry::new("liveness");
    let producer = create_kafka_producer(
        &config.kafka,
        liveness.register("generator", time::Duration::seconds(30)),
    )
    .await?;

    let mut sent = 0;
    let mut failed = 0;
    while sent + failed < config.generate_count {
        let chunk_size = config
            .generate_chunk_size
            .max(1)
            .min(config.generate_count - sent - failed);
        let chunk = {
            let mut rng = rand::thread_rng();
            (0..chunk_size)
                .map(|_| generate_report(&mut rng, &config))
                .collect::<Result<Vec<_>, _>>()?
        };

        for result in send_iter_to_kafka(&producer, &config.report_topic, chunk).await {
            match result {
                Ok(()) => sent += 1,
                Err(e) => {
                    eprintln!("failed to send report: {e}");
                    failed += 1;
                }
            }
        }
        println!("Sent {sent} reports, {failed} failed");
    }
    Ok(())
}
