use aws_config::BehaviorVersion;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::Client as S3Client;
use lambda_runtime::{run, service_fn, Error, LambdaEvent};
use partner_exchange::config::lambda::{build_s3_job, load_exchange_config, LambdaConfig, S3Storage};
use partner_exchange::core::job::JobInvocation;
use partner_exchange::utils::{logger, validation::Validate};
use partner_exchange::JobRequest;
use serde::Serialize;
use std::collections::HashMap;

#[derive(Serialize)]
pub struct PartnerSummary {
    pub partner: String,
    pub success: bool,
    pub ingested: usize,
    pub processed: usize,
    pub batch_name: Option<String>,
    pub error: Option<String>,
}

#[derive(Serialize)]
pub struct Response {
    pub message: String,
    pub job_id: String,
    pub payload: HashMap<String, String>,
    pub partners: Vec<PartnerSummary>,
}

fn boxed(e: partner_exchange::ExchangeError) -> Error {
    Box::new(e)
}

async fn function_handler(event: LambdaEvent<JobRequest>) -> Result<Response, Error> {
    let (request, context) = event.into_parts();
    let job_id = request.job_id.clone().unwrap_or(context.request_id);
    tracing::info!("Starting exchange tick {}", job_id);

    let lambda_config = LambdaConfig::from_env().map_err(boxed)?;
    lambda_config.validate().map_err(boxed)?;

    let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
    let config = aws_sdk_s3::config::Builder::from(&config)
        .region(Region::new(lambda_config.s3_region.clone()))
        .force_path_style(true)
        .build();
    let s3_client = S3Client::from_conf(config);

    let storage = S3Storage::new(s3_client.clone(), lambda_config.s3_bucket.clone());
    let exchange_config = load_exchange_config(&storage, &lambda_config.config_key)
        .await
        .map_err(boxed)?;
    let job = build_s3_job(&s3_client, &lambda_config, &exchange_config, &request.partners)
        .map_err(boxed)?;

    let outcome = job
        .run(JobInvocation {
            job_id,
            payload: request.payload,
        })
        .await;

    let message = if outcome.is_success() {
        "Exchange tick completed successfully".to_string()
    } else {
        "Exchange tick completed with partner failures".to_string()
    };

    let partners = outcome
        .partners
        .iter()
        .map(|p| PartnerSummary {
            partner: p.partner_key.clone(),
            success: p.is_success(),
            ingested: p.report.as_ref().map(|r| r.ingest.handled).unwrap_or(0),
            processed: p.report.as_ref().map(|r| r.process.handled).unwrap_or(0),
            batch_name: p.report.as_ref().and_then(|r| r.emit.batch_name.clone()),
            error: p.error.as_ref().map(|e| e.to_string()),
        })
        .collect();

    tracing::info!("{}", message);
    Ok(Response {
        message,
        job_id: outcome.job_id,
        payload: outcome.payload,
        partners,
    })
}

#[tokio::main]
async fn main() -> Result<(), Error> {
    logger::init_lambda_logger();
    run(service_fn(function_handler)).await
}
