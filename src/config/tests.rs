use config::{Config, File, FileFormat};

use super::EngineSettings;

fn parse(raw: &str) -> EngineSettings {
    Config::builder()
        .add_source(File::from_str(raw, FileFormat::Yaml))
        .build()
        .expect("build")
        .try_deserialize()
        .expect("deserialize")
}

#[test]
fn full_pool_section() {
    let settings = parse(
        r#"
default:
  mysql: mysql://app@localhost/app
  redis: localhost:6379:0
  locker: default
  localCache: 1000
  rabbitMQ:
    server: amqp://localhost:5672
    queues:
      - name: jobs
        durable: true
        prefetch_count: 50
        router: events
        router_keys: [user]
    routers:
      - name: events
        type: fanout
        durable: true
        delayed: true
  dirtyQueues:
    user_changed: 100
log:
  mysql: mysql://app@localhost/app_log
"#,
    );
    assert_eq!(settings.pools.len(), 2);
    let default = &settings.pools["default"];
    assert_eq!(default.local_cache, Some(1000));
    assert_eq!(default.locker.as_deref(), Some("default"));
    assert_eq!(default.redis.as_deref(), Some("localhost:6379:0"));
    let rabbit = default.rabbitmq.as_ref().expect("rabbit section");
    assert_eq!(rabbit.queues.len(), 1);
    assert!(rabbit.queues[0].durable);
    assert_eq!(rabbit.queues[0].prefetch_count, 50);
    assert_eq!(rabbit.queues[0].router, "events");
    assert_eq!(rabbit.routers[0].kind, "fanout");
    assert!(rabbit.routers[0].delayed);
    assert_eq!(default.dirty_queues["user_changed"], 100);
    assert!(settings.pools["log"].redis.is_none());
}

#[test]
fn minimal_section() {
    let settings = parse("default:\n  mysql: mysql://root@localhost/app\n");
    let default = &settings.pools["default"];
    assert!(default.rabbitmq.is_none());
    assert!(default.dirty_queues.is_empty());
}
